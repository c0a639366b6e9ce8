//! Inter-node messaging contract (spec ยง6) and an in-process implementation
//! suitable for exercising the pipeline without a real RPC transport, which
//! is out of scope (spec ยง1).

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::batch::Batch;
use crate::context::NodeId;
use crate::errors::{Error, Result};

/// A message kind from spec ยง6: either a data-partition payload or a
/// partition-count report.
#[derive(Debug)]
pub enum TransportMessage {
    DataPartition {
        from: NodeId,
        payload: Batch,
        is_empty: bool,
    },
    PartitionCountReport {
        from: NodeId,
        count: u64,
    },
}

pub trait Transport: Send + Sync {
    fn send_partition(&self, query_id: &str, from: NodeId, to: NodeId, payload: Batch, is_empty: bool) -> Result<()>;
    fn send_count(&self, query_id: &str, from: NodeId, to: NodeId, count: u64) -> Result<()>;

    /// Registers an inbox for `(query_id, node)` and returns its receiver.
    /// Must be called before any peer sends to this endpoint.
    fn register(&self, query_id: &str, node: NodeId) -> Receiver<TransportMessage>;
}

/// Shared, in-memory hub routing messages by `(query_id, destination node)`.
/// One `crossbeam` channel per destination endpoint; multiple senders may
/// hold the matching `Sender` clone, which preserves each sender's own
/// message order relative to itself -- the property `DistributingKernel`
/// relies on (a peer's data partitions are always observed before that same
/// peer's count report, spec ยง5 "Ordering guarantees").
#[derive(Default)]
pub struct InProcessTransport {
    inboxes: Mutex<HashMap<(String, NodeId), Sender<TransportMessage>>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(InProcessTransport::default())
    }

    fn sender_for(&self, query_id: &str, to: NodeId) -> Result<Sender<TransportMessage>> {
        self.inboxes
            .lock()
            .get(&(query_id.to_string(), to))
            .cloned()
            .ok_or_else(|| Error::transport(to, "no registered inbox for destination"))
    }
}

impl Transport for InProcessTransport {
    fn send_partition(&self, query_id: &str, from: NodeId, to: NodeId, payload: Batch, is_empty: bool) -> Result<()> {
        let sender = self.sender_for(query_id, to)?;
        sender
            .send(TransportMessage::DataPartition {
                from,
                payload,
                is_empty,
            })
            .map_err(|_| Error::transport(to, "inbox closed"))
    }

    fn send_count(&self, query_id: &str, from: NodeId, to: NodeId, count: u64) -> Result<()> {
        let sender = self.sender_for(query_id, to)?;
        sender
            .send(TransportMessage::PartitionCountReport { from, count })
            .map_err(|_| Error::transport(to, "inbox closed"))
    }

    fn register(&self, query_id: &str, node: NodeId) -> Receiver<TransportMessage> {
        let (tx, rx) = channel::unbounded();
        self.inboxes
            .lock()
            .insert((query_id.to_string(), node), tx);
        rx
    }
}
