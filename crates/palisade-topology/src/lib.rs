//! Backend topology for the palisade proxy.
//!
//! A [`Cluster`] owns an ordered list of [`Replica`]s, each of which
//! owns an ordered list of [`Node`]s. Selection walks the tree with a
//! round-robin cursor at each level and prefers the least-loaded
//! active candidate, where a node's load is its open connection count
//! plus a transient failure penalty. Heartbeats run as background
//! tasks per node and flip the node's active flag; they stop when the
//! config generation that created them is replaced.

mod cluster;
mod heartbeat;
mod node;
mod replica;

pub use cluster::{Cluster, Credentials};
pub use heartbeat::{
    is_healthy, spawn_heartbeat, HeartbeatConfig, HeartbeatError, ProbeClient,
    DEFAULT_PROBE_PATH, DEFAULT_PROBE_RESPONSE,
};
pub use node::{Node, PenaltyConfig};
pub use replica::Replica;
