//! DistributeAggregateKernel (spec ยง4.5): hash-partitions grouped batches
//! across peers, or funnels scalar-aggregate partials to the master.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::batch::{Batch, CacheData};
use crate::cache::CacheMachine;
use crate::context::Context;
use crate::distributing::{spawn_partition_listener, DistributingKernel, PartitionCountRegistry, PartitionCounters};
use crate::errors::{Error, Result};
use crate::executor::Stream;
use crate::kernel::{Kernel, KernelCore};
use crate::operators::{parse_group_by_expression, OperatorDescriptor};
use crate::primitives::AggregatePrimitives;
use crate::transport::Transport;

pub struct DistributeAggregateKernel {
    core: KernelCore,
    descriptor: OperatorDescriptor,
    query_id: String,
    transport: Arc<dyn Transport>,
    counters: PartitionCounters,
    received: Arc<PartitionCountRegistry>,
    /// Guards the scalar-aggregate non-master placeholder: deposited once,
    /// on the first batch, so downstream Merge always sees at least one
    /// schema-carrying batch (spec ยง4.5).
    placeholder_sent: AtomicBool,
    _listener: thread::JoinHandle<()>,
}

impl DistributeAggregateKernel {
    pub fn new(
        id: u64,
        expression: &str,
        context: Arc<Context>,
        input_cache: Arc<CacheMachine>,
        output_cache: Arc<CacheMachine>,
        transport: Arc<dyn Transport>,
        query_id: impl Into<String>,
    ) -> Result<Self> {
        let descriptor = parse_group_by_expression(expression)?;
        let query_id = query_id.into();
        let received = Arc::new(PartitionCountRegistry::new());

        let inbox = transport.register(&query_id, context.this_node());
        let listener = spawn_partition_listener(
            inbox,
            output_cache.clone(),
            received.clone(),
            context.peers(),
        );

        Ok(DistributeAggregateKernel {
            core: KernelCore::new(id, expression, context, input_cache, output_cache),
            descriptor,
            query_id,
            transport,
            counters: PartitionCounters::new(),
            received,
            placeholder_sent: AtomicBool::new(false),
            _listener: listener,
        })
    }

    fn do_process_scalar(&self, batch: Batch, output: &CacheMachine, primitives: &dyn AggregatePrimitives) -> Result<()> {
        let ctx = &self.core().context;
        if ctx.is_master() {
            output.add_to_cache(CacheData::from_batch(batch), true)?;
            self.counters.increment(ctx.this_node());
        } else {
            if !self.placeholder_sent.swap(true, Ordering::SeqCst) {
                let placeholder = primitives.create_empty_table(batch.schema());
                output.add_to_cache(CacheData::from_batch(placeholder), true)?;
                self.counters.increment(ctx.this_node());
            }
            let is_empty = batch.num_rows() == 0;
            self.transport
                .send_partition(&self.query_id, ctx.this_node(), ctx.master_node(), batch, is_empty)?;
            self.counters.increment(ctx.master_node());
        }
        Ok(())
    }

    fn do_process_grouped(&self, batch: Batch, primitives: &dyn AggregatePrimitives) -> Result<()> {
        let n = self.core().context.total_nodes();
        let partitions = if batch.num_rows() == 0 {
            (0..n).map(|_| primitives.create_empty_table(batch.schema())).collect()
        } else {
            let (reordered, offsets) = primitives.hash_partition(&batch, &self.descriptor.group_column_indices, n)?;
            primitives.split(&reordered, &offsets[1..])?
        };
        self.scatter(partitions)
    }
}

impl DistributingKernel for DistributeAggregateKernel {
    fn partition_counters(&self) -> &PartitionCounters {
        &self.counters
    }

    fn received_counts(&self) -> &PartitionCountRegistry {
        &self.received
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Kernel for DistributeAggregateKernel {
    fn core(&self) -> &KernelCore {
        &self.core
    }

    fn do_process(
        &self,
        inputs: Vec<Batch>,
        output: &CacheMachine,
        _stream: &Stream,
        primitives: &dyn AggregatePrimitives,
    ) -> Result<()> {
        let batch = inputs
            .into_iter()
            .next()
            .ok_or_else(|| Error::compute("DistributeAggregate task received no input batch"))?;

        if self.descriptor.group_column_indices.is_empty() {
            self.do_process_scalar(batch, output, primitives)
        } else {
            self.do_process_grouped(batch, primitives)
        }
    }

    fn finalize(&self, _primitives: &dyn AggregatePrimitives) -> Result<()> {
        self.send_total_partition_counts()?;
        let total = self.get_total_partition_counts();
        self.core().output_cache.wait_for_count(total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::{NodeId, QueryTokens};
    use crate::primitives::ArrowAggregatePrimitives;
    use crate::transport::InProcessTransport;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn batch(k: &[i64]) -> Batch {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(k.to_vec()))]).unwrap()
    }

    fn two_node_context(this: u32) -> Arc<Context> {
        Arc::new(Context::new(
            NodeId(this),
            NodeId(0),
            vec![NodeId(0), NodeId(1)],
            QueryTokens {
                query_id: "q".into(),
                step: 1,
                substep: 0,
            },
        ))
    }

    #[test]
    fn scalar_master_deposits_locally_and_counts_self() {
        let transport = InProcessTransport::new();
        let ctx = two_node_context(0);
        transport.register("q", NodeId(1));
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let kernel = DistributeAggregateKernel::new(0, "|SUM(0)|total", ctx, input, output.clone(), transport, "q").unwrap();

        let primitives = ArrowAggregatePrimitives;
        kernel.do_process(vec![batch(&[1])], &output, &Stream, &primitives).unwrap();
        assert_eq!(kernel.partition_counters().get(NodeId(0)), 1);
        assert_eq!(output.total_rows_added(), 1);
    }

    #[test]
    fn grouped_scatter_delivers_local_partition_to_own_output() {
        let transport = InProcessTransport::new();
        let ctx = two_node_context(0);
        transport.register("q", NodeId(1));
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let kernel = DistributeAggregateKernel::new(0, "0||", ctx, input, output.clone(), transport, "q").unwrap();

        let primitives = ArrowAggregatePrimitives;
        kernel
            .do_process(vec![batch(&[1, 2, 3, 4])], &output, &Stream, &primitives)
            .unwrap();
        // Two peers share four rows; each receives a partition (possibly
        // empty), so the local partition always lands even if empty.
        assert!(output.total_rows_added() >= 1);
    }
}
