//! Query-scoped metadata shared read-only by every kernel in a query (spec
//! ยง3 "Context").

use std::collections::HashMap;

/// A node's identity within the cluster. Wraps the node's ordinal index in
/// `Context::node_order`, not an opaque address -- resolving a peer's
/// transport endpoint is the transport layer's job, not the context's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Logging/metrics tokens identifying a running query, carried on every
/// structured log line the pipeline emits (spec ยง6).
#[derive(Debug, Clone)]
pub struct QueryTokens {
    pub query_id: String,
    pub step: u32,
    pub substep: u32,
}

#[derive(Debug)]
pub struct Context {
    this_node: NodeId,
    master_node: NodeId,
    node_order: HashMap<NodeId, usize>,
    tokens: QueryTokens,
}

impl Context {
    pub fn new(this_node: NodeId, master_node: NodeId, nodes: Vec<NodeId>, tokens: QueryTokens) -> Self {
        let node_order = nodes.into_iter().enumerate().map(|(i, n)| (n, i)).collect();
        Context {
            this_node,
            master_node,
            node_order,
            tokens,
        }
    }

    pub fn this_node(&self) -> NodeId {
        self.this_node
    }

    pub fn master_node(&self) -> NodeId {
        self.master_node
    }

    pub fn is_master(&self) -> bool {
        self.this_node == self.master_node
    }

    pub fn total_nodes(&self) -> usize {
        self.node_order.len()
    }

    /// All nodes other than `this_node`, in ordinal order.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.node_order.keys().copied().collect();
        nodes.sort_by_key(|n| self.node_order[n]);
        nodes.retain(|n| *n != self.this_node);
        nodes
    }

    /// All nodes, in ordinal order -- the order hash-partitioning assigns
    /// buckets in.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.node_order.keys().copied().collect();
        nodes.sort_by_key(|n| self.node_order[n]);
        nodes
    }

    pub fn ordinal(&self, node: NodeId) -> Option<usize> {
        self.node_order.get(&node).copied()
    }

    pub fn node_at_ordinal(&self, ordinal: usize) -> Option<NodeId> {
        self.node_order
            .iter()
            .find(|(_, &ord)| ord == ordinal)
            .map(|(n, _)| *n)
    }

    pub fn tokens(&self) -> &QueryTokens {
        &self.tokens
    }
}
