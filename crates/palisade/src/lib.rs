//! HTTP reverse proxy and load balancer for columnar analytical
//! databases.
//!
//! The proxy authenticates inbound clients, maps them to backend-side
//! credentials, enforces per-user and per-backend-user concurrency and
//! rate limits with admission queueing, dispatches to the least-loaded
//! healthy node with round-robin tie-breaking and transient failure
//! penalties, enforces execution deadlines with remote query kill, and
//! serves a single-flight response cache.
//!
//! The heavy lifting lives in the sibling crates: `palisade-core`
//! (counters and rate windows), `palisade-topology` (clusters,
//! replicas, nodes, heartbeats), `palisade-admission` (queues and
//! limits) and `palisade-cache` (the response cache). This crate ties
//! them together behind an HTTP listener.

pub mod auth;
pub mod config;
mod metrics;
pub mod proxy;
pub mod query;
pub mod scope;
pub mod server;
pub mod state;
pub mod users;

use bytes::Bytes;
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;

/// HTTP client used for proxied requests and kill-query calls. Probe
/// loops use the topology crate's identical alias.
pub type UpstreamClient = hyper_util::client::legacy::Client<HttpConnector, Full<Bytes>>;
