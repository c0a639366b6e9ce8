//! Compute -> Distribute -> Merge aggregation pipeline for a clustered,
//! batch-at-a-time SQL execution engine.
//!
//! The pipeline is a three kernel subgraph driven by a shared [`TaskExecutor`]:
//! each kernel reads from one [`CacheMachine`] and writes to another. See
//! [`kernels`] for the three stage implementations and [`cache`] for the
//! queue they communicate through.

pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod distributing;
pub mod errors;
pub mod executor;
pub mod kernel;
pub mod kernels;
pub mod metrics;
pub mod operators;
pub mod primitives;
pub mod transport;

pub use batch::{Batch, CacheData};
pub use cache::CacheMachine;
pub use context::{Context, NodeId};
pub use distributing::DistributingKernel;
pub use errors::{Error, Result};
pub use executor::TaskExecutor;
pub use kernel::Kernel;
pub use kernels::{ComputeAggregateKernel, DistributeAggregateKernel, MergeAggregateKernel};
pub use operators::{AggregationType, OperatorDescriptor};
pub use primitives::{AggregatePrimitives, ArrowAggregatePrimitives};
pub use transport::{InProcessTransport, Transport};
