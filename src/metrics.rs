//! Process-wide metrics for the aggregation pipeline (spec ยง6 "Observable side
//! effects"), following the `lazy_static!` + `prometheus` static-metric
//! convention used for other per-component counters in this codebase.

use lazy_static::lazy_static;
use prometheus::*;
use prometheus_static_metric::*;

make_auto_flush_static_metric! {
    pub struct TaskCounter: LocalIntCounter {
        "type" => {
            submitted,
            completed,
            failed,
        },
    }
}

lazy_static! {
    pub static ref KERNEL_TASK_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "clusteragg_kernel_task_counter",
        "Total number of tasks submitted/completed/failed, by kernel id",
        &["kernel_id", "type"]
    )
    .unwrap();
    pub static ref CACHE_DEPTH_GAUGE_VEC: IntGaugeVec = register_int_gauge_vec!(
        "clusteragg_cache_depth",
        "Number of batches currently queued in a cache machine",
        &["kernel_id"]
    )
    .unwrap();
    pub static ref CACHE_ROWS_ADDED_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "clusteragg_cache_rows_added_total",
        "Monotonic count of batches accepted into a cache machine",
        &["kernel_id"]
    )
    .unwrap();
    pub static ref PARTITION_COUNT_RECONCILED_VEC: IntCounterVec = register_int_counter_vec!(
        "clusteragg_partition_counts_reconciled_total",
        "Number of partition-count reports reconciled at the merge barrier",
        &["kernel_id"]
    )
    .unwrap();
    pub static ref BARRIER_WAIT_SECONDS_VEC: HistogramVec = register_histogram_vec!(
        "clusteragg_barrier_wait_seconds",
        "Time a kernel's run() spent blocked on its completion barrier",
        &["kernel_id"]
    )
    .unwrap();
}
