//! DistributingKernel: the scatter/send_message machinery, per-peer message
//! counters and partition-count exchange shared by any kernel that routes
//! partitioned data across the cluster (spec ยง3 "PartitionCounter", ยง4.5).
//!
//! In this pipeline only `DistributeAggregateKernel` uses it, but it is kept
//! as its own layer over `Kernel` the way the component table in SPEC_FULL.md
//! ยง2 describes it -- a reusable base, not logic folded directly into the
//! aggregate-specific kernel.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};

use crate::batch::{Batch, CacheData};
use crate::cache::CacheMachine;
use crate::context::NodeId;
use crate::errors::Result;
use crate::kernel::Kernel;
use crate::metrics::PARTITION_COUNT_RECONCILED_VEC;
use crate::transport::{Transport, TransportMessage};

/// Per-peer count of partitions this kernel has sent (spec ยง3
/// "PartitionCounter"). Read by `send_total_partition_counts`.
#[derive(Default)]
pub struct PartitionCounters {
    sent: Mutex<HashMap<NodeId, u64>>,
}

impl PartitionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, peer: NodeId) {
        *self.sent.lock().entry(peer).or_insert(0) += 1;
    }

    pub fn get(&self, peer: NodeId) -> u64 {
        self.sent.lock().get(&peer).copied().unwrap_or(0)
    }
}

/// Counts this kernel has *received* from each peer's partition-count
/// report, plus its own self-count recorded without a network hop (spec
/// ยง4.5 "get_total_partition_counts... sums the counts this node has
/// received from all peers, including itself").
#[derive(Default)]
pub struct PartitionCountRegistry {
    received: Mutex<HashMap<NodeId, u64>>,
    cv: Condvar,
}

impl PartitionCountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, from: NodeId, count: u64) {
        let mut received = self.received.lock();
        received.insert(from, count);
        self.cv.notify_all();
    }

    /// Blocks until a report has been recorded for every node in
    /// `expected`, then returns the sum.
    pub fn wait_for_all(&self, expected: &[NodeId]) -> u64 {
        let mut received = self.received.lock();
        while !expected.iter().all(|n| received.contains_key(n)) {
            self.cv.wait(&mut received);
        }
        expected.iter().map(|n| received[n]).sum()
    }
}

pub trait DistributingKernel: Kernel {
    fn partition_counters(&self) -> &PartitionCounters;
    fn received_counts(&self) -> &PartitionCountRegistry;
    fn transport(&self) -> &dyn Transport;
    fn query_id(&self) -> &str;

    /// Routes already-partitioned batches to peers by ordinal position,
    /// delivering locally when the destination is this node (spec ยง4.5).
    fn scatter(&self, partitions: Vec<Batch>) -> Result<()> {
        let ctx = self.core().context.clone();
        for (ordinal, partition) in partitions.into_iter().enumerate() {
            let Some(peer) = ctx.node_at_ordinal(ordinal) else {
                continue;
            };
            let is_empty = partition.num_rows() == 0;
            if peer == ctx.this_node() {
                self.core()
                    .output_cache
                    .add_to_cache(CacheData::from_batch(partition), true)?;
            } else {
                self.transport()
                    .send_partition(self.query_id(), ctx.this_node(), peer, partition, is_empty)?;
            }
            self.partition_counters().increment(peer);
        }
        Ok(())
    }

    /// After the per-batch task barrier: tell each peer how many partitions
    /// this node sent it.
    fn send_total_partition_counts(&self) -> Result<()> {
        let ctx = &self.core().context;
        for peer in ctx.peers() {
            let count = self.partition_counters().get(peer);
            self.transport()
                .send_count(self.query_id(), ctx.this_node(), peer, count)?;
        }
        Ok(())
    }

    /// Records this node's own count directly, then blocks until every
    /// peer's report has arrived, returning the grand total this node
    /// should expect on its output cache.
    fn get_total_partition_counts(&self) -> u64 {
        let ctx = &self.core().context;
        let self_node = ctx.this_node();
        self.received_counts()
            .record(self_node, self.partition_counters().get(self_node));
        let total = self.received_counts().wait_for_all(&ctx.all_nodes());
        PARTITION_COUNT_RECONCILED_VEC
            .with_label_values(&[&self.id_string()])
            .inc();
        total
    }
}

/// Drains a node's inbox, routing incoming data partitions into
/// `output_cache` and count reports into `registry`. Exits once a report
/// has been seen for every node in `remote_peers` -- by the time a peer's
/// own count report is observed, all of that peer's data partitions are
/// already ahead of it in this same per-sender channel (spec ยง5 "Ordering
/// guarantees"), so nothing is left unprocessed when the loop exits.
pub fn spawn_partition_listener(
    receiver: Receiver<TransportMessage>,
    output_cache: Arc<CacheMachine>,
    registry: Arc<PartitionCountRegistry>,
    remote_peers: Vec<NodeId>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("agg-partition-listener".into())
        .spawn(move || {
            let mut reported: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
            for msg in receiver {
                match msg {
                    TransportMessage::DataPartition { payload, is_empty, .. } => {
                        if let Err(e) = output_cache.add_to_cache(CacheData::from_batch(payload), is_empty) {
                            log::error!("partition listener failed to deliver partition: {}", e);
                        }
                    }
                    TransportMessage::PartitionCountReport { from, count } => {
                        registry.record(from, count);
                        reported.insert(from);
                    }
                }
                if remote_peers.iter().all(|p| reported.contains(p)) {
                    break;
                }
            }
        })
        .expect("failed to spawn partition listener thread")
}
