//! ComputeAggregateKernel (spec ยง4.4): one partial aggregate per input batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::batch::{Batch, CacheData};
use crate::cache::CacheMachine;
use crate::context::Context;
use crate::errors::Result;
use crate::executor::Stream;
use crate::kernel::{Kernel, KernelCore};
use crate::operators::{parse_group_by_expression, OperatorDescriptor};
use crate::primitives::{apply_operator, AggregatePrimitives};

pub struct ComputeAggregateKernel {
    core: KernelCore,
    descriptor: OperatorDescriptor,
    /// The upstream producer's own row-count estimate, if known. Used as the
    /// numerator in `estimate_output_rows` (spec ยง4.4).
    upstream_estimate: Option<u64>,
    rows_consumed: AtomicU64,
    rows_emitted: AtomicU64,
}

impl ComputeAggregateKernel {
    pub fn new(
        id: u64,
        expression: &str,
        context: Arc<Context>,
        input_cache: Arc<CacheMachine>,
        output_cache: Arc<CacheMachine>,
        upstream_estimate: Option<u64>,
    ) -> Result<Self> {
        let descriptor = parse_group_by_expression(expression)?;
        Ok(ComputeAggregateKernel {
            core: KernelCore::new(id, expression, context, input_cache, output_cache),
            descriptor,
            upstream_estimate,
            rows_consumed: AtomicU64::new(0),
            rows_emitted: AtomicU64::new(0),
        })
    }

    /// For scalar aggregates, always 1. Otherwise scales the upstream
    /// estimate by this kernel's observed selectivity so far; `None` if
    /// nothing has been consumed yet (spec ยง4.4).
    pub fn estimate_output_rows(&self) -> Option<u64> {
        if self.descriptor.is_scalar_aggregate() {
            return Some(1);
        }
        let consumed = self.rows_consumed.load(Ordering::Relaxed);
        if consumed == 0 {
            return None;
        }
        let emitted = self.rows_emitted.load(Ordering::Relaxed);
        self.upstream_estimate
            .map(|upstream| upstream.saturating_mul(emitted) / consumed)
    }
}

impl Kernel for ComputeAggregateKernel {
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
            .ok_or_else(|| crate::errors::Error::compute("ComputeAggregate task received no input batch"))?;

        self.rows_consumed
            .fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        let result = apply_operator(&batch, &self.descriptor, primitives)?;
        self.rows_emitted
            .fetch_add(result.num_rows() as u64, Ordering::Relaxed);
        output.add_to_cache(CacheData::from_batch(result), true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::{NodeId, QueryTokens};
    use crate::primitives::ArrowAggregatePrimitives;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn single_node_context() -> Arc<Context> {
        Arc::new(Context::new(
            NodeId(0),
            NodeId(0),
            vec![NodeId(0)],
            QueryTokens {
                query_id: "q".into(),
                step: 0,
                substep: 0,
            },
        ))
    }

    fn batch(k: &[i64], v: &[i64]) -> Batch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(k.to_vec())), Arc::new(Int64Array::from(v.to_vec()))],
        )
        .unwrap()
    }

    #[test]
    fn emits_one_partial_batch_per_input_batch() {
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let kernel = ComputeAggregateKernel::new(
            0,
            "0|SUM(1)|total",
            single_node_context(),
            input,
            output.clone(),
            None,
        )
        .unwrap();

        let primitives = ArrowAggregatePrimitives;
        kernel
            .do_process(vec![batch(&[1, 1, 2], &[10, 20, 5])], &output, &Stream, &primitives)
            .unwrap();

        let result = output.pull_cache_data().unwrap().materialize().unwrap();
        assert_eq!(result.num_rows(), 2);
    }

    #[test]
    fn rejects_expression_with_no_groups_and_no_aggregations() {
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let err = ComputeAggregateKernel::new(0, "||", single_node_context(), input, output, None);
        assert!(err.is_err());
    }
}
