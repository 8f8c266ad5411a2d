//! Periodic health probes against backend nodes.

use crate::{Credentials, Node};
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HTTP client shared by all probe loops of a config generation.
pub type ProbeClient = Client<HttpConnector, Full<Bytes>>;

/// The well-known liveness path. It requires no authentication on the
/// backend, so configured credentials are not attached when probing it.
pub const DEFAULT_PROBE_PATH: &str = "/ping";

/// Expected response body on the default liveness path.
pub const DEFAULT_PROBE_RESPONSE: &str = "Ok.\n";

/// Probe endpoint, cadence and expectations.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Path appended to the node's base URL.
    pub path: String,
    /// Body a healthy node must answer with.
    pub expect: String,
    /// Sleep between probes.
    pub interval: Duration,
    /// Per-probe deadline.
    pub timeout: Duration,
    /// Attached only when `path` is not the default liveness path.
    pub credentials: Option<Credentials>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROBE_PATH.to_string(),
            expect: DEFAULT_PROBE_RESPONSE.to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            credentials: None,
        }
    }
}

/// Distinct probe failure kinds; the loop logs them and flips the
/// node's active flag either way.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("probe request failed: {0}")]
    Unreachable(#[from] hyper_util::client::legacy::Error),
    #[error("probe response body could not be read: {0}")]
    Body(#[from] hyper::Error),
    #[error("probe timed out")]
    Timeout,
    #[error("unexpected status code {0}")]
    BadStatus(u16),
    #[error("unexpected response body {0:?}")]
    UnexpectedBody(String),
    #[error("invalid probe path {0:?}")]
    InvalidPath(String),
}

/// Issues one probe: GET `base + path` under the configured timeout.
/// Healthy iff HTTP 200 and the body equals the expected string.
pub async fn is_healthy(
    client: &ProbeClient,
    base: &http::Uri,
    config: &HeartbeatConfig,
) -> Result<(), HeartbeatError> {
    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(
        config
            .path
            .parse()
            .map_err(|_| HeartbeatError::InvalidPath(config.path.clone()))?,
    );
    let uri = http::Uri::from_parts(parts)
        .map_err(|_| HeartbeatError::InvalidPath(config.path.clone()))?;

    let mut builder = http::Request::get(uri);
    if let Some(creds) = &config.credentials {
        // The default liveness path is unauthenticated on the backend.
        if config.path != DEFAULT_PROBE_PATH {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.user, creds.password));
            builder = builder.header(http::header::AUTHORIZATION, format!("Basic {token}"));
        }
    }
    let request = builder
        .body(Full::new(Bytes::new()))
        .map_err(|_| HeartbeatError::InvalidPath(config.path.clone()))?;

    let response = tokio::time::timeout(config.timeout, client.request(request))
        .await
        .map_err(|_| HeartbeatError::Timeout)??;

    if response.status() != http::StatusCode::OK {
        return Err(HeartbeatError::BadStatus(response.status().as_u16()));
    }

    let body = response.into_body().collect().await?.to_bytes();
    if body.as_ref() != config.expect.as_bytes() {
        let snippet = String::from_utf8_lossy(&body[..body.len().min(256)]).into_owned();
        return Err(HeartbeatError::UnexpectedBody(snippet));
    }
    Ok(())
}

/// Spawns the probe loop for one node.
///
/// The loop probes immediately, then every `interval`, and exits when
/// the owning config generation's token is cancelled. Each outcome is
/// written to the node's active flag; transitions are logged.
pub fn spawn_heartbeat(
    node: Arc<Node>,
    config: HeartbeatConfig,
    client: ProbeClient,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut was_active = node.is_active();
        loop {
            match is_healthy(&client, node.addr(), &config).await {
                Ok(()) => {
                    node.set_active(true);
                    if !was_active {
                        info!(node = node.host(), cluster = node.cluster(), "node is alive");
                    }
                    was_active = true;
                }
                Err(err) => {
                    node.set_active(false);
                    metrics::counter!(
                        "heartbeat_failures_total",
                        "cluster" => node.cluster().to_string(),
                        "replica" => node.replica().to_string(),
                        "node" => node.host().to_string(),
                    )
                    .increment(1);
                    if was_active {
                        warn!(node = node.host(), cluster = node.cluster(), %err, "node went down");
                    } else {
                        debug!(node = node.host(), %err, "node still down");
                    }
                    was_active = false;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.interval) => {}
            }
        }
    });
}
