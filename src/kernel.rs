//! Kernel lifecycle, task bookkeeping and the completion barrier shared by
//! every stage (spec ยง3 "Kernel", ยง4.3, ยง9 "Condition-variable completion
//! barrier").

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::batch::Batch;
use crate::cache::CacheMachine;
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::executor::{Stream, TaskExecutor};
use crate::primitives::AggregatePrimitives;

/// A join barrier over a kernel's outstanding task set: `register()` marks a
/// task as in flight, `complete()` marks it done, and `wait_empty()` blocks
/// until none remain. The contract only requires that `run()` not return
/// until every submitted task has been observed complete; this is realized
/// with a `Mutex<HashSet<_>>` + `Condvar` rather than a counted latch so the
/// set itself stays inspectable for debugging.
pub struct TaskBarrier {
    next_id: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
    cv: Condvar,
}

impl Default for TaskBarrier {
    fn default() -> Self {
        TaskBarrier {
            next_id: AtomicU64::new(0),
            outstanding: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }
}

impl TaskBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.outstanding.lock().insert(id);
        id
    }

    pub fn complete(&self, id: u64) {
        let mut set = self.outstanding.lock();
        set.remove(&id);
        self.cv.notify_all();
    }

    pub fn wait_empty(&self) {
        let mut set = self.outstanding.lock();
        while !set.is_empty() {
            self.cv.wait(&mut set);
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }
}

/// Fields every kernel stage has regardless of its specific `do_process`:
/// identity, the query-scoped expression text, shared context, its two
/// caches, the task barrier, and a slot for the first error any of its
/// tasks observed (spec ยง7 propagation policy).
pub struct KernelCore {
    pub id: u64,
    pub expression: String,
    pub context: Arc<Context>,
    pub input_cache: Arc<CacheMachine>,
    pub output_cache: Arc<CacheMachine>,
    pub barrier: TaskBarrier,
    error: Mutex<Option<Error>>,
}

impl KernelCore {
    pub fn new(
        id: u64,
        expression: impl Into<String>,
        context: Arc<Context>,
        input_cache: Arc<CacheMachine>,
        output_cache: Arc<CacheMachine>,
    ) -> Self {
        KernelCore {
            id,
            expression: expression.into(),
            context,
            input_cache,
            output_cache,
            barrier: TaskBarrier::new(),
            error: Mutex::new(None),
        }
    }
}

pub trait Kernel: Send + Sync {
    fn core(&self) -> &KernelCore;

    /// Processes one task's worth of input batches, depositing results into
    /// `output`. Invoked by a `TaskExecutor` worker thread; may run
    /// concurrently with other tasks from the same kernel.
    fn do_process(
        &self,
        inputs: Vec<Batch>,
        output: &CacheMachine,
        stream: &Stream,
        primitives: &dyn AggregatePrimitives,
    ) -> Result<()>;

    /// Stage-specific work done after the task barrier releases but before
    /// the output cache is finished. No-op by default; `DistributeAggregateKernel`
    /// uses it for partition-count reconciliation (spec ยง4.5).
    fn finalize(&self, _primitives: &dyn AggregatePrimitives) -> Result<()> {
        Ok(())
    }

    fn id_string(&self) -> String {
        self.core().id.to_string()
    }

    fn barrier(&self) -> &TaskBarrier {
        &self.core().barrier
    }

    /// Records the first task failure observed; later ones are logged but
    /// do not overwrite it, so `run()` re-raises a single representative
    /// error (spec ยง7).
    fn record_error(&self, err: Error) {
        let mut slot = self.core().error.lock();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            log::warn!(
                "kernel {} observed an additional task failure after one was already recorded: {}",
                self.core().id,
                err
            );
        }
    }

    fn take_error(&self) -> Option<Error> {
        self.core().error.lock().take()
    }

    /// The shared run-loop (spec ยง4.3): pull batches, submit one task per
    /// batch, wait for the barrier, run stage-specific finalization, then
    /// finish the output cache. `MergeAggregateKernel` overrides this
    /// entirely -- its finalization must start *before* any task exists
    /// (spec ยง4.6).
    fn run(self: Arc<Self>, executor: &TaskExecutor) -> Result<()>
    where
        Self: Sized + 'static,
    {
        let core = self.core();
        log::debug!(
            "kernel {} run() starting, query={} step={} substep={}",
            core.id,
            core.context.tokens().query_id,
            core.context.tokens().step,
            core.context.tokens().substep
        );
        let dyn_self: Arc<dyn Kernel> = self.clone();
        while let Some(cache_data) = core.input_cache.pull_cache_data() {
            executor.add_task(dyn_self.clone(), vec![cache_data], core.output_cache.clone());
        }
        core.barrier.wait_empty();

        let outcome = match self.take_error() {
            Some(err) => Err(err),
            None => self.finalize(executor.primitives()),
        };
        core.output_cache.finish();
        log::debug!("kernel {} run() finished, ok={}", core.id, outcome.is_ok());
        outcome
    }
}
