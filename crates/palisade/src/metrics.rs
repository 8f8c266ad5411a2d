//! Metric call sites.
//!
//! All counters and gauges are emitted through the `metrics` facade;
//! the Prometheus recorder is installed once per process and rendered
//! on `/metrics`. Request metrics carry (user, cluster, cluster_user)
//! labels plus node/replica where a node is bound; cache metrics carry
//! (cache, user, cluster, cluster_user) and deliberately exclude the
//! node, entries are shared across the whole cluster.

use crate::scope::Scope;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder exactly once and returns the
/// render handle. Subsequent calls (config reloads, tests starting
/// several servers) reuse the first installation.
pub fn prometheus_handle() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("no other global metrics recorder may be installed")
        })
        .clone()
}

pub fn record_request(scope: &Scope) {
    metrics::counter!(
        "request_sum_total",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
        "cluster_user" => scope.backend_user().name().to_string(),
    )
    .increment(1);
}

pub fn record_status(scope: &Scope, status: u16, started: Instant) {
    let node = scope.node();
    metrics::counter!(
        "status_codes_total",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
        "cluster_user" => scope.backend_user().name().to_string(),
        "replica" => node.replica().to_string(),
        "node" => node.host().to_string(),
        "code" => status.to_string(),
    )
    .increment(1);
    if (200..300).contains(&status) {
        metrics::counter!(
            "request_success_total",
            "user" => scope.user().name().to_string(),
            "cluster" => scope.cluster_name().to_string(),
            "cluster_user" => scope.backend_user().name().to_string(),
        )
        .increment(1);
    }
    metrics::histogram!(
        "request_duration_seconds",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
    )
    .record(started.elapsed().as_secs_f64());
}

/// Mirrors the user's concurrency counter as a gauge; called after
/// every admission and release.
pub fn record_running(scope: &Scope) {
    metrics::gauge!(
        "concurrent_queries",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
    )
    .set(scope.user().limits().running() as f64);
}

pub fn record_timeout(scope: &Scope) {
    metrics::counter!(
        "timeout_request_total",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
        "cluster_user" => scope.backend_user().name().to_string(),
    )
    .increment(1);
}

pub fn record_client_gone(scope: &Scope) {
    metrics::counter!(
        "canceled_request_total",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
        "cluster_user" => scope.backend_user().name().to_string(),
    )
    .increment(1);
}

pub fn record_kill(scope: &Scope, succeeded: bool) {
    metrics::counter!(
        "killed_request_total",
        "cluster" => scope.cluster_name().to_string(),
        "outcome" => if succeeded { "ok" } else { "error" },
    )
    .increment(1);
}

pub fn record_retry(scope: &Scope) {
    metrics::counter!(
        "proxy_retries_total",
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
    )
    .increment(1);
}

pub fn record_cache_hit(cache: &str, scope: &Scope) {
    cache_counter("cache_hits_total", cache, scope);
}

pub fn record_cache_miss(cache: &str, scope: &Scope) {
    cache_counter("cache_miss_total", cache, scope);
}

fn cache_counter(name: &'static str, cache: &str, scope: &Scope) {
    metrics::counter!(
        name,
        "cache" => cache.to_string(),
        "user" => scope.user().name().to_string(),
        "cluster" => scope.cluster_name().to_string(),
        "cluster_user" => scope.backend_user().name().to_string(),
    )
    .increment(1);
}

pub fn record_bad_request() {
    metrics::counter!("bad_requests_total").increment(1);
}
