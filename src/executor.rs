//! TaskExecutor: the process-wide pool that runs `do_process` invocations
//! submitted by kernels (spec ยง4.2).
//!
//! Grounded on the `Builder` / `Worker` shape this codebase uses for its
//! other background thread pools, but backed by `crossbeam::channel` rather
//! than a `yatp` future pool -- `crossbeam` is already part of this
//! codebase's dependency graph for exactly this kind of bounded MPMC work
//! queue, and a plain blocking worker loop is a better match for `do_process`
//! invocations that run a synchronous aggregate primitive to completion
//! (see DESIGN.md).

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};

use crate::batch::CacheData;
use crate::cache::CacheMachine;
use crate::config::ExecutorConfig;
use crate::kernel::Kernel;
use crate::metrics::KERNEL_TASK_COUNTER_VEC;
use crate::primitives::AggregatePrimitives;

/// A `do_process` invocation: the input batches it was handed, the output
/// cache to deposit results into, and the kernel that owns the task's
/// lifecycle bookkeeping (spec ยง3 "Task").
struct Job {
    inputs: Vec<CacheData>,
    output: Arc<CacheMachine>,
    kernel: Arc<dyn Kernel>,
    task_id: u64,
}

/// A GPU stream placeholder. Real stream management (allocation, device
/// synchronization) is out of scope (spec ยง1); the executor still threads a
/// token through so `do_process` signatures don't change if it is filled in
/// later.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stream;

pub struct TaskExecutor {
    sender: Sender<Job>,
    _workers: Vec<thread::JoinHandle<()>>,
    primitives: Arc<dyn AggregatePrimitives>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig, primitives: Arc<dyn AggregatePrimitives>) -> Arc<Self> {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = if config.get_pending_capacity() == usize::MAX {
            channel::unbounded()
        } else {
            channel::bounded(config.get_pending_capacity())
        };

        let mut workers = Vec::with_capacity(config.get_thread_count());
        for worker_idx in 0..config.get_thread_count() {
            let receiver = receiver.clone();
            let primitives = primitives.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("agg-exec-{worker_idx}"))
                    .spawn(move || Self::worker_loop(receiver, primitives))
                    .expect("failed to spawn task executor worker thread"),
            );
        }

        Arc::new(TaskExecutor {
            sender,
            _workers: workers,
            primitives,
        })
    }

    fn worker_loop(receiver: Receiver<Job>, primitives: Arc<dyn AggregatePrimitives>) {
        let stream = Stream;
        for job in receiver {
            let batches: Vec<_> = job
                .inputs
                .iter()
                .map(|cd| cd.materialize())
                .collect::<Result<_, _>>();
            let result = match batches {
                Ok(batches) => job
                    .kernel
                    .do_process(batches, &job.output, &stream, primitives.as_ref()),
                Err(e) => Err(e),
            };
            let kernel_id = job.kernel.id_string();
            if let Err(e) = result {
                KERNEL_TASK_COUNTER_VEC
                    .with_label_values(&[&kernel_id, "failed"])
                    .inc();
                log::error!(
                    "task failed kernel_id={} task_id={} err={}",
                    kernel_id,
                    job.task_id,
                    e
                );
                job.kernel.record_error(e);
            } else {
                KERNEL_TASK_COUNTER_VEC
                    .with_label_values(&[&kernel_id, "completed"])
                    .inc();
            }
            job.kernel.barrier().complete(job.task_id);
        }
    }

    /// Enqueues a task; the worker that picks it up materializes `inputs`,
    /// invokes `kernel.do_process`, then removes the task from the kernel's
    /// outstanding set and notifies its completion barrier -- on success or
    /// failure alike (spec ยง4.2, ยง7 propagation policy).
    pub fn add_task(&self, kernel: Arc<dyn Kernel>, inputs: Vec<CacheData>, output: Arc<CacheMachine>) {
        let task_id = kernel.barrier().register();
        KERNEL_TASK_COUNTER_VEC
            .with_label_values(&[&kernel.id_string(), "submitted"])
            .inc();
        let job = Job {
            inputs,
            output,
            kernel,
            task_id,
        };
        if self.sender.send(job).is_err() {
            // Channel only disconnects if every worker thread has panicked;
            // surface it the same way a task failure would.
            log::error!("task executor queue is closed, dropping task");
        }
    }

    pub fn primitives(&self) -> &dyn AggregatePrimitives {
        self.primitives.as_ref()
    }
}
