//! A cluster: replicas, selection entry points and kill-query
//! credentials.

use crate::{HeartbeatConfig, Node, Replica};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A username/password pair used backend-side (kill-query account,
/// authenticated heartbeat probes).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// An ordered list of replicas with a round-robin cursor.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    replicas: Vec<Arc<Replica>>,
    cursor: AtomicUsize,
    kill_query_user: Option<Credentials>,
    heartbeat: HeartbeatConfig,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        replicas: Vec<Arc<Replica>>,
        kill_query_user: Option<Credentials>,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        assert!(!replicas.is_empty(), "cluster requires at least one replica");
        Self {
            name: name.into(),
            replicas,
            cursor: AtomicUsize::new(0),
            kill_query_user,
            heartbeat,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    /// Credentials used for `KILL QUERY` requests against this
    /// cluster's nodes, when configured.
    pub fn kill_query_user(&self) -> Option<&Credentials> {
        self.kill_query_user.as_ref()
    }

    pub fn heartbeat(&self) -> &HeartbeatConfig {
        &self.heartbeat
    }

    /// All nodes of all replicas, in ownership order. Heartbeat wiring
    /// iterates this at config apply.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.replicas.iter().flat_map(|r| r.nodes().iter())
    }

    /// Picks the next replica with the same round-robin-plus-least-load
    /// rule nodes use within a replica.
    pub fn least_loaded_replica(&self) -> Arc<Replica> {
        let n = self.replicas.len();
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % n;
        let indexed = &self.replicas[idx];
        if indexed.is_active() && indexed.load() == 0 {
            return Arc::clone(indexed);
        }

        let mut best: Option<&Arc<Replica>> = indexed.is_active().then_some(indexed);
        for offset in 1..n {
            let candidate = &self.replicas[(idx + offset) % n];
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

    /// Binds a request to a node.
    ///
    /// With a non-empty session id the selection is pinned by hash,
    /// replica and node alike, and no round-robin cursor moves; an
    /// unhealthy pinned node falls through to the regular scan. This
    /// keeps sticky traffic from perturbing the rotation seen by
    /// unrelated requests.
    pub fn select_node(&self, session_id: Option<&str>) -> Arc<Node> {
        if let Some(sid) = session_id.filter(|s| !s.is_empty()) {
            let replica = &self.replicas[fnv1a_32(sid.as_bytes()) as usize % self.replicas.len()];
            if let Some(node) = replica.node_for_session(sid) {
                return node;
            }
        }
        self.least_loaded_replica().least_loaded_node()
    }
}

/// 32-bit FNV-1a over the session id, shared with the node-level pick.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
