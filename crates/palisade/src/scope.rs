//! The per-request scope: one immutable binding of a frontend user to
//! a backend user, cluster and node, plus the unique id the backend
//! knows the query by.

use crate::state::ClusterHandle;
use crate::users::{BackendUser, ParamGroup, User};
use crate::UpstreamClient;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::Full;
use palisade_admission::{admit, dec_pair, inc_pair, AdmissionError};
use palisade_topology::{Credentials, Node};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Session timeout applied when the client supplies none (or not a
/// positive integer).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline on the kill-query round trip.
const KILL_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Query parameters passed through to the backend verbatim.
const PASS_THROUGH_PARAMS: &[&str] = &[
    "query",
    "database",
    "default_format",
    "compress",
    "decompress",
    "enable_http_compression",
    "max_result_rows",
    "extremes",
    "result_overflow_mode",
    "session_id",
];

/// Scope ids are a process-wide counter seeded from the wall clock at
/// startup, so ids stay unique across quick restarts too. The hex
/// rendering doubles as the backend `query_id`.
static SCOPE_IDS: LazyLock<AtomicU64> = LazyLock::new(|| {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    AtomicU64::new(seconds << 32)
});

fn next_scope_id() -> u64 {
    SCOPE_IDS.fetch_add(1, Ordering::SeqCst)
}

pub struct Scope {
    id: u64,
    started: Instant,
    user: Arc<User>,
    backend_user: Arc<BackendUser>,
    cluster: Arc<ClusterHandle>,
    node: Mutex<Arc<Node>>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    session_id: Option<String>,
    session_timeout: Duration,
    cancelled: AtomicBool,
}

impl Scope {
    pub fn new(
        user: Arc<User>,
        backend_user: Arc<BackendUser>,
        cluster: Arc<ClusterHandle>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        session_id: Option<String>,
        session_timeout: Duration,
    ) -> Self {
        let node = cluster.topology.select_node(session_id.as_deref());
        Self {
            id: next_scope_id(),
            started: Instant::now(),
            user,
            backend_user,
            cluster,
            node: Mutex::new(node),
            remote_addr,
            local_addr,
            session_id,
            session_timeout,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id_hex(&self) -> String {
        format!("{:x}", self.id)
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn backend_user(&self) -> &Arc<BackendUser> {
        &self.backend_user
    }

    pub fn cluster(&self) -> &Arc<ClusterHandle> {
        &self.cluster
    }

    pub fn cluster_name(&self) -> &str {
        self.cluster.topology.name()
    }

    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node.lock())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Effective execution deadline: the stricter of the two caps.
    pub fn execution_deadline(&self) -> Duration {
        self.user
            .execution_cap()
            .min(self.backend_user.execution_cap())
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Re-binds the scope to a freshly selected node. Called between
    /// queue-wait attempts and before dispatch retries.
    pub fn reselect_node(&self) {
        let node = self.cluster.topology.select_node(self.session_id.as_deref());
        *self.node.lock() = node;
    }

    /// Runs the admission protocol. On success the returned guard owns
    /// the concurrency slots and the chosen node's connection; it
    /// releases them on drop whatever happens to the request.
    pub async fn enter(self: &Arc<Self>) -> Result<AdmissionGuard, AdmissionError> {
        let admitted: Mutex<Option<Arc<Node>>> = Mutex::new(None);
        admit(
            self.user.limits(),
            self.backend_user.limits(),
            || {
                inc_pair(self.user.limits(), self.backend_user.limits())?;
                let node = self.node();
                node.connections().inc();
                *admitted.lock() = Some(node);
                Ok(())
            },
            || self.reselect_node(),
        )
        .await?;

        let node = admitted
            .lock()
            .take()
            .unwrap_or_else(|| self.node());
        crate::metrics::record_running(self);
        Ok(AdmissionGuard {
            scope: Arc::clone(self),
            node,
        })
    }

    /// Builds the request the backend actually sees: curated query
    /// parameters, scope id as `query_id`, backend credentials, the
    /// chosen node's scheme and authority.
    pub fn build_upstream_request(
        &self,
        method: &http::Method,
        client_params: &[(String, String)],
        headers: &HeaderMap,
        body: Bytes,
        param_group: Option<&ParamGroup>,
        is_multipart: bool,
    ) -> Result<http::Request<Full<Bytes>>, http::Error> {
        let node = self.node();

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if let Some(group) = param_group {
            for (key, value) in &group.params {
                query.append_pair(key, value);
            }
        }
        for (key, value) in client_params {
            if key == "session_timeout" {
                // Overridden below with the scope's resolved value.
                continue;
            }
            let external_data = is_multipart
                && (key.ends_with("_types")
                    || key.ends_with("_structure")
                    || key.ends_with("_format"));
            if PASS_THROUGH_PARAMS.contains(&key.as_str()) || external_data {
                query.append_pair(key, value);
            }
        }
        if is_multipart {
            // External-data staging must never be served from cache.
            query.append_pair("no_cache", "1");
        }
        query.append_pair("query_id", &self.id_hex());
        query.append_pair(
            "session_timeout",
            &self.session_timeout.as_secs().to_string(),
        );
        let query_string = query.finish();

        let mut parts = node.addr().clone().into_parts();
        parts.path_and_query = Some(
            format!("/?{query_string}")
                .parse()
                .expect("url-encoded query string is a valid path"),
        );
        let uri = http::Uri::from_parts(parts).expect("node address plus path is a valid uri");

        let mut builder = http::Request::builder().method(method.clone()).uri(uri);
        if let Some(out) = builder.headers_mut() {
            copy_headers(headers, out);
            out.insert(
                http::header::AUTHORIZATION,
                basic_auth(self.backend_user.name(), self.backend_user.password()),
            );
            let agent = format!(
                "RemoteAddr: {}; LocalAddr: {}; User: {}; BackendUser: {}; {}",
                self.remote_addr,
                self.local_addr,
                self.user.name(),
                self.backend_user.name(),
                headers
                    .get(http::header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(""),
            );
            if let Ok(value) = HeaderValue::from_str(agent.trim_end_matches("; ")) {
                out.insert(http::header::USER_AGENT, value);
            }
        }
        builder.body(Full::new(body))
    }

    /// Forcibly cancels the query on the backend. Invoked after a
    /// client disconnect or an execution deadline; failure is logged
    /// and never surfaced to the client.
    pub async fn kill_query(&self, client: &UpstreamClient) {
        let node = self.node();
        let credentials = self
            .cluster
            .topology
            .kill_query_user()
            .cloned()
            .unwrap_or_else(|| Credentials {
                user: "default".to_string(),
                password: String::new(),
            });

        let statement = format!("KILL QUERY WHERE query_id = '{}'", self.id_hex());
        let query_string = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("query", &statement)
            .finish();

        let mut parts = node.addr().clone().into_parts();
        parts.path_and_query = match format!("/?{query_string}").parse() {
            Ok(pq) => Some(pq),
            Err(err) => {
                warn!(scope = %self.id_hex(), %err, "cannot build kill-query uri");
                return;
            }
        };
        let uri = match http::Uri::from_parts(parts) {
            Ok(uri) => uri,
            Err(err) => {
                warn!(scope = %self.id_hex(), %err, "cannot build kill-query uri");
                return;
            }
        };

        let request = http::Request::post(uri)
            .header(
                http::header::AUTHORIZATION,
                basic_auth(&credentials.user, &credentials.password),
            )
            .body(Full::new(Bytes::new()));
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                warn!(scope = %self.id_hex(), %err, "cannot build kill-query request");
                return;
            }
        };

        let outcome = tokio::time::timeout(KILL_QUERY_TIMEOUT, client.request(request)).await;
        match outcome {
            Ok(Ok(response)) if response.status().is_success() => {
                debug!(scope = %self.id_hex(), node = node.host(), "killed remote query");
                crate::metrics::record_kill(self, true);
            }
            Ok(Ok(response)) => {
                warn!(
                    scope = %self.id_hex(),
                    node = node.host(),
                    status = response.status().as_u16(),
                    "kill query rejected by backend"
                );
                crate::metrics::record_kill(self, false);
            }
            Ok(Err(err)) => {
                warn!(scope = %self.id_hex(), node = node.host(), %err, "kill query failed");
                crate::metrics::record_kill(self, false);
            }
            Err(_) => {
                warn!(scope = %self.id_hex(), node = node.host(), "kill query timed out");
                crate::metrics::record_kill(self, false);
            }
        }
    }
}

/// Releases the admission counters and the node connection on drop, so
/// no code path (success, error, panic, client disconnect) can leak a
/// counter.
pub struct AdmissionGuard {
    scope: Arc<Scope>,
    node: Arc<Node>,
}

impl AdmissionGuard {
    /// The node whose connection counter this guard owns.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        dec_pair(self.scope.user.limits(), self.scope.backend_user.limits());
        self.node.connections().dec();
        crate::metrics::record_running(&self.scope);
    }
}

fn basic_auth(user: &str, password: &str) -> HeaderValue {
    let token = BASE64.encode(format!("{user}:{password}"));
    HeaderValue::from_str(&format!("Basic {token}"))
        .unwrap_or_else(|_| HeaderValue::from_static("Basic"))
}

/// Copies client headers to the upstream request, dropping hop-by-hop
/// headers, any prior authorization and backend-specific
/// `X-ClickHouse-*` headers.
fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_dropped_header(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_dropped_header(name: &HeaderName) -> bool {
    if name.as_str().starts_with("x-clickhouse-") {
        return true;
    }
    matches!(
        *name,
        http::header::AUTHORIZATION
            | http::header::HOST
            | http::header::CONNECTION
            | http::header::CONTENT_LENGTH
            | http::header::TRANSFER_ENCODING
            | http::header::UPGRADE
    )
}
