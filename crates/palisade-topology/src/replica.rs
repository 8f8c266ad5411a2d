//! A replica: an ordered set of interchangeable nodes.

use crate::Node;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An ordered list of nodes with a round-robin cursor.
///
/// A replica is active iff any of its nodes is active.
#[derive(Debug)]
pub struct Replica {
    name: String,
    nodes: Vec<Arc<Node>>,
    cursor: AtomicUsize,
}

impl Replica {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>) -> Self {
        assert!(!nodes.is_empty(), "replica requires at least one node");
        Self {
            name: name.into(),
            nodes,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn is_active(&self) -> bool {
        self.nodes.iter().any(|n| n.is_active())
    }

    /// Sum of node loads; the cluster selector compares replicas on
    /// this value.
    pub fn load(&self) -> u64 {
        self.nodes.iter().map(|n| n.load()).sum()
    }

    /// Picks the next node: advance the round-robin cursor, take the
    /// indexed node if it is active and idle, otherwise scan the rest
    /// in cursor order for the first idle active node, falling back to
    /// the least-loaded active one. With no active node at all, the
    /// indexed node is returned as a best effort.
    pub fn least_loaded_node(&self) -> Arc<Node> {
        let n = self.nodes.len();
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % n;
        let indexed = &self.nodes[idx];
        if indexed.is_active() && indexed.load() == 0 {
            return Arc::clone(indexed);
        }

        let mut best: Option<&Arc<Node>> = indexed.is_active().then_some(indexed);
        for offset in 1..n {
            let candidate = &self.nodes[(idx + offset) % n];
            if !candidate.is_active() {
                continue;
            }
            if candidate.load() == 0 {
                return Arc::clone(candidate);
            }
            match best {
                Some(b) if candidate.load() >= b.load() => {}
                _ => best = Some(candidate),
            }
        }
        Arc::clone(best.unwrap_or(indexed))
    }

    /// Sticky-session lookup: hash the session id onto a fixed node
    /// index. Returns the node only while it is active; callers fall
    /// through to [`least_loaded_node`](Self::least_loaded_node)
    /// otherwise. Does not touch the round-robin cursor, so sticky
    /// traffic leaves unrelated requests' rotation undisturbed.
    pub fn node_for_session(&self, session_id: &str) -> Option<Arc<Node>> {
        let idx = fnv1a_32(session_id.as_bytes()) as usize % self.nodes.len();
        let node = &self.nodes[idx];
        node.is_active().then(|| Arc::clone(node))
    }
}

/// 32-bit FNV-1a, the fixed session-affinity hash.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
