//! A single backend node.

use palisade_core::Counter;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tuning for the transient failure penalty.
#[derive(Debug, Clone)]
pub struct PenaltyConfig {
    /// Added to the node's load on each failure.
    pub size: u32,
    /// Upper bound on the accumulated penalty.
    pub max: u32,
    /// How long each penalty increment stays in effect.
    pub duration: Duration,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            size: 5,
            max: 300,
            duration: Duration::from_secs(10),
        }
    }
}

/// One backend host:port with its health and load state.
///
/// Counters follow the increment/decrement protocol from
/// `palisade-core`; the penalty is a plain bounded atomic because it
/// is adjusted in `size`-steps rather than by one.
#[derive(Debug)]
pub struct Node {
    addr: http::Uri,
    cluster: String,
    replica: String,
    active: AtomicBool,
    connections: Counter,
    penalty: AtomicU32,
    penalty_cfg: PenaltyConfig,
}

impl Node {
    /// Creates an inactive node; the first heartbeat decides whether it
    /// serves traffic.
    pub fn new(addr: http::Uri, cluster: impl Into<String>, replica: impl Into<String>) -> Self {
        Self::with_penalty(addr, cluster, replica, PenaltyConfig::default())
    }

    /// Creates a node with custom penalty tuning.
    pub fn with_penalty(
        addr: http::Uri,
        cluster: impl Into<String>,
        replica: impl Into<String>,
        penalty_cfg: PenaltyConfig,
    ) -> Self {
        Self {
            addr,
            cluster: cluster.into(),
            replica: replica.into(),
            active: AtomicBool::new(false),
            connections: Counter::new(),
            penalty: AtomicU32::new(0),
            penalty_cfg,
        }
    }

    /// Scheme + host:port of the backend.
    pub fn addr(&self) -> &http::Uri {
        &self.addr
    }

    /// Host part of the address, used in metric labels and error bodies.
    pub fn host(&self) -> &str {
        self.addr.host().unwrap_or("")
    }

    /// Name of the owning cluster.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Name of the owning replica.
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Whether the most recent heartbeat succeeded.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Records a heartbeat outcome.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        metrics::gauge!(
            "node_health",
            "cluster" => self.cluster.clone(),
            "replica" => self.replica.clone(),
            "node" => self.host().to_string(),
        )
        .set(if active { 1.0 } else { 0.0 });
    }

    /// Counter of proxied requests currently open against this node.
    pub fn connections(&self) -> &Counter {
        &self.connections
    }

    /// Current penalty value.
    pub fn penalty(&self) -> u32 {
        self.penalty.load(Ordering::SeqCst)
    }

    /// Open connections plus penalty. Selection treats this as the
    /// node's priority; lower wins.
    pub fn load(&self) -> u64 {
        let conns = self.connections.load().max(0) as u64;
        conns + u64::from(self.penalty())
    }

    /// Depresses this node's priority after a failure.
    ///
    /// Adds `size` up to `max` and schedules the same amount to be
    /// subtracted after `duration`. A node already at `max` is left
    /// untouched.
    pub fn penalize(self: &Arc<Self>) {
        let cfg = &self.penalty_cfg;
        let mut added = 0;
        let _ = self
            .penalty
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                if p >= cfg.max {
                    return None;
                }
                let next = (p + cfg.size).min(cfg.max);
                added = next - p;
                Some(next)
            });
        if added == 0 {
            return;
        }

        metrics::counter!(
            "node_penalties_total",
            "cluster" => self.cluster.clone(),
            "replica" => self.replica.clone(),
            "node" => self.host().to_string(),
        )
        .increment(1);

        let node = Arc::clone(self);
        let duration = self.penalty_cfg.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = node
                .penalty
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                    Some(p.saturating_sub(added))
                });
        });
    }
}
