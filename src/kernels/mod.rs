//! The three concrete stages of the pipeline (spec ยง4.4-ยง4.6): parse an
//! operator descriptor once at construction, then drive it through the
//! shared `Kernel` machinery in `crate::kernel`.

pub mod compute;
pub mod distribute;
pub mod merge;

pub use compute::ComputeAggregateKernel;
pub use distribute::DistributeAggregateKernel;
pub use merge::MergeAggregateKernel;
