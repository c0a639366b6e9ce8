//! MergeAggregateKernel (spec ยง4.6): waits for all partials, concatenates,
//! and re-aggregates with rewritten operators. Its `run()` differs enough
//! from the shared per-batch loop that it overrides `Kernel::run` entirely
//! rather than supplying a `finalize()` hook.

use std::sync::Arc;

use crate::batch::{Batch, CacheData};
use crate::cache::CacheMachine;
use crate::context::Context;
use crate::errors::Result;
use crate::executor::{Stream, TaskExecutor};
use crate::kernel::{Kernel, KernelCore};
use crate::operators::{parse_group_by_expression, OperatorDescriptor};
use crate::primitives::{apply_operator, AggregatePrimitives};

pub struct MergeAggregateKernel {
    core: KernelCore,
    descriptor: OperatorDescriptor,
}

impl MergeAggregateKernel {
    pub fn new(
        id: u64,
        expression: &str,
        context: Arc<Context>,
        input_cache: Arc<CacheMachine>,
        output_cache: Arc<CacheMachine>,
    ) -> Result<Self> {
        let descriptor = parse_group_by_expression(expression)?;
        Ok(MergeAggregateKernel {
            core: KernelCore::new(id, expression, context, input_cache, output_cache),
            descriptor,
        })
    }
}

impl Kernel for MergeAggregateKernel {
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
        if inputs.is_empty() {
            return Ok(());
        }

        // Non-master nodes never see real scalar-aggregate data here --
        // Distribute routed it all to master -- only their own placeholder.
        if self.descriptor.is_scalar_aggregate() && !self.core().context.is_master() {
            for batch in inputs {
                output.add_to_cache(CacheData::from_batch(batch), true)?;
            }
            return Ok(());
        }

        if primitives.check_if_concatenating_strings_will_overflow(&inputs) {
            log::warn!(
                "kernel {} concatenating string columns across {} partials may overflow i32 offsets",
                self.core().id,
                inputs.len()
            );
        }

        let concatenated = primitives.concat_tables(&inputs)?;
        let column_names: Vec<String> = concatenated
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let rewritten = primitives.mod_group_by_parameters_for_merge(&self.descriptor, &column_names)?;
        let result = apply_operator(&concatenated, &rewritten, primitives)?;
        output.add_to_cache(CacheData::from_batch(result), true)?;
        Ok(())
    }

    /// Overrides the shared per-batch loop: Merge cannot emit anything until
    /// every upstream partial is known to have arrived (spec ยง4.6).
    fn run(self: Arc<Self>, executor: &TaskExecutor) -> Result<()>
    where
        Self: Sized + 'static,
    {
        let core = self.core();
        log::debug!("kernel {} (merge) run() starting, draining input cache", core.id);
        core.input_cache.wait_until_finished();

        let mut collected = Vec::new();
        while core.input_cache.wait_for_next() {
            if let Some(item) = core.input_cache.pull_cache_data() {
                collected.push(item);
            }
        }

        let dyn_self: Arc<dyn Kernel> = self.clone();
        executor.add_task(dyn_self, collected, core.output_cache.clone());
        core.barrier.wait_empty();

        let outcome = match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        core.output_cache.finish();
        log::debug!("kernel {} (merge) run() finished, ok={}", core.id, outcome.is_ok());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::context::{NodeId, QueryTokens};
    use crate::primitives::ArrowAggregatePrimitives;
    use arrow::array::{Float64Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn single_node_context() -> Arc<Context> {
        Arc::new(Context::new(
            NodeId(0),
            NodeId(0),
            vec![NodeId(0)],
            QueryTokens {
                query_id: "q".into(),
                step: 2,
                substep: 0,
            },
        ))
    }

    fn partial(k: &[i64], sum: &[f64], count: &[i64]) -> Batch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("m__sum", DataType::Float64, false),
            Field::new("m__count", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(k.to_vec())),
                Arc::new(Float64Array::from(sum.to_vec())),
                Arc::new(Int64Array::from(count.to_vec())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn merges_mean_partials_from_two_batches() {
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let kernel = MergeAggregateKernel::new(
            0,
            "0|MEAN(1)|m",
            single_node_context(),
            input.clone(),
            output.clone(),
        )
        .unwrap();

        input
            .add_to_cache(CacheData::from_batch(partial(&[1], &[6.0], &[2])), true)
            .unwrap();
        input
            .add_to_cache(CacheData::from_batch(partial(&[1], &[2.0], &[1])), true)
            .unwrap();
        input.finish();

        let primitives = ArrowAggregatePrimitives;
        let collected: Vec<Batch> = std::iter::from_fn(|| input.pull_cache_data())
            .map(|cd| cd.materialize().unwrap())
            .collect();
        kernel.do_process(collected, &output, &Stream, &primitives).unwrap();

        let result = output.pull_cache_data().unwrap().materialize().unwrap();
        assert_eq!(result.num_rows(), 1);
        let mean = result
            .column_by_name("m")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(mean.value(0), 8.0 / 3.0);
    }

    #[test]
    fn empty_input_produces_no_output() {
        let input = Arc::new(CacheMachine::new("in", CacheConfig::new()));
        let output = Arc::new(CacheMachine::new("out", CacheConfig::new()));
        let kernel = MergeAggregateKernel::new(0, "0|SUM(1)|total", single_node_context(), input, output.clone(), )
            .unwrap();
        let primitives = ArrowAggregatePrimitives;
        kernel.do_process(vec![], &output, &Stream, &primitives).unwrap();
        assert_eq!(output.total_rows_added(), 0);
    }
}
