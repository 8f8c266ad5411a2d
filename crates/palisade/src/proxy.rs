//! The reverse-proxy dispatcher.
//!
//! Request lifecycle: route → authenticate → authorize → scope →
//! admission → decorate → (cache | direct) dispatch with deadline,
//! cancellation and retry → status bookkeeping.
//!
//! Error taxonomy to status codes:
//! bad credentials → 401; network or scheme deny → 403; admission
//! overflow → 429; upstream unreachable (connect failure or upstream
//! 502) → 502 after penalty and retries; execution deadline → 504 plus
//! remote kill; client disconnect → 499 bookkeeping plus remote kill;
//! single-flight grace expiry → 408; unknown path → 400; unknown
//! method → 405.

use crate::auth::extract_credentials;
use crate::query;
use crate::scope::{Scope, DEFAULT_SESSION_TIMEOUT};
use crate::state::Generation;
use crate::users::ParamGroup;
use crate::{metrics, UpstreamClient};
use arc_swap::ArcSwap;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use metrics_exporter_prometheus::PrometheusHandle;
use palisade_cache::{CacheKey, Lookup, ResponseCache};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Response body type used throughout the proxy.
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Process-wide dispatcher state. The generation cell is swapped on
/// config reload; each request loads it once and keeps that snapshot.
pub struct AppState {
    pub generation: ArcSwap<Generation>,
    pub client: UpstreamClient,
    pub prometheus: PrometheusHandle,
    pub listener_is_tls: bool,
}

pub(crate) fn body_from(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(body_from(text.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Top-level request entry point, one call per inbound HTTP request.
pub async fn handle(
    state: Arc<AppState>,
    request: Request<Incoming>,
    remote: SocketAddr,
    local: SocketAddr,
) -> Response<Body> {
    let generation = state.generation.load_full();

    if request.method() == Method::OPTIONS {
        let mut response = Response::new(body_from(Bytes::new()));
        response
            .headers_mut()
            .insert(http::header::ALLOW, HeaderValue::from_static("GET,POST"));
        return response;
    }

    if request.method() != Method::GET && request.method() != Method::POST {
        let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
        return response;
    }

    match request.uri().path() {
        "/metrics" => {
            if !generation.metrics_networks.allows(remote.ip()) {
                return text_response(
                    StatusCode::FORBIDDEN,
                    format!("connections to /metrics are not allowed from {}", remote.ip()),
                );
            }
            text_response(StatusCode::OK, state.prometheus.render())
        }
        "/favicon.ico" => Response::new(body_from(Bytes::new())),
        "/" | "/query" => {
            if !generation.http_networks.allows(remote.ip()) {
                return text_response(
                    StatusCode::FORBIDDEN,
                    format!("connections are not allowed from {}", remote.ip()),
                );
            }
            proxy_request(&state, &generation, request, remote, local).await
        }
        path => {
            metrics::record_bad_request();
            text_response(StatusCode::BAD_REQUEST, format!("unsupported path: {path:?}"))
        }
    }
}

async fn proxy_request(
    state: &Arc<AppState>,
    generation: &Arc<Generation>,
    request: Request<Incoming>,
    remote: SocketAddr,
    local: SocketAddr,
) -> Response<Body> {
    let params: Vec<(String, String)> = request
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let (user_name, password) = extract_credentials(request.headers(), &params);
    let Some(user) = generation.users.get(&user_name) else {
        return text_response(
            StatusCode::UNAUTHORIZED,
            format!("invalid username or password for user {user_name:?}"),
        );
    };
    if !user.password_matches(&password) {
        return text_response(
            StatusCode::UNAUTHORIZED,
            format!("invalid username or password for user {user_name:?}"),
        );
    }

    let is_tls = state.listener_is_tls;
    if is_tls && user.denies_https() {
        return text_response(
            StatusCode::FORBIDDEN,
            format!("user {user_name:?} is not allowed to access via https"),
        );
    }
    if !is_tls && user.denies_http() {
        return text_response(
            StatusCode::FORBIDDEN,
            format!("user {user_name:?} is not allowed to access via http"),
        );
    }

    if !user.networks().allows(remote.ip()) {
        return text_response(
            StatusCode::FORBIDDEN,
            format!("user {user_name:?} is not allowed to access from {}", remote.ip()),
        );
    }

    // References resolved at config load; a miss here is a bug, not a
    // client error.
    let Some(cluster) = generation.clusters.get(user.to_cluster()) else {
        error!(user = %user_name, cluster = user.to_cluster(), "dangling cluster reference");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    };
    let Some(backend_user) = cluster.users.get(user.to_user()) else {
        error!(user = %user_name, backend_user = user.to_user(), "dangling backend user");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    };
    if !backend_user.networks().allows(remote.ip()) {
        return text_response(
            StatusCode::FORBIDDEN,
            format!(
                "backend user {:?} is not allowed to access from {}",
                backend_user.name(),
                remote.ip()
            ),
        );
    }

    let session_id = find_param(&params, "session_id")
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let session_timeout = find_param(&params, "session_timeout")
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);

    let scope = Arc::new(Scope::new(
        Arc::clone(user),
        Arc::clone(backend_user),
        Arc::clone(cluster),
        remote,
        local,
        session_id,
        session_timeout,
    ));
    metrics::record_request(&scope);
    debug!(
        scope = %scope.id_hex(),
        user = user.name(),
        cluster = scope.cluster_name(),
        node = %scope.node().host(),
        "request bound"
    );

    let _admission = match scope.enter().await {
        Ok(guard) => guard,
        Err(err) => {
            let response = text_response(StatusCode::TOO_MANY_REQUESTS, err.to_string());
            metrics::record_status(&scope, response.status().as_u16(), scope.started());
            return response;
        }
    };

    let is_multipart = request
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));
    let gzipped_body = request
        .headers()
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    let headers = request.headers().clone();
    let method = request.method().clone();

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            let response =
                text_response(StatusCode::BAD_REQUEST, format!("cannot read request body: {err}"));
            metrics::record_status(&scope, response.status().as_u16(), scope.started());
            return response;
        }
    };

    let url_query = find_param(&params, "query").unwrap_or_default().to_string();
    let full_query = if is_multipart {
        url_query.clone().into_bytes()
    } else {
        query::full_query(&url_query, &body)
    };
    let no_cache = is_multipart || find_param(&params, "no_cache") == Some("1");

    let param_group = user
        .param_group()
        .and_then(|name| generation.param_groups.get(name))
        .cloned();

    let cache = user
        .cache_name()
        .and_then(|name| generation.caches.get(name))
        .cloned();
    let use_cache = cache.is_some() && !no_cache && query::is_cacheable(&full_query);

    let exchange = Exchange {
        state,
        scope: &scope,
        method,
        params: &params,
        headers,
        body,
        param_group: param_group.as_deref(),
        is_multipart,
        full_query: &full_query,
        gzipped_body,
    };

    let mut response = match &cache {
        Some(cache) if use_cache => cached_dispatch(&exchange, cache).await,
        _ => direct_dispatch(&exchange).await,
    };

    if user.cors_allowed() {
        response.headers_mut().insert(
            http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
    }
    metrics::record_status(&scope, response.status().as_u16(), scope.started());
    response
}

fn find_param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Everything one dispatch attempt needs; borrowed from the request
/// handler so retries can rebuild the upstream request per node.
struct Exchange<'a> {
    state: &'a Arc<AppState>,
    scope: &'a Arc<Scope>,
    method: Method,
    params: &'a [(String, String)],
    headers: HeaderMap,
    body: Bytes,
    param_group: Option<&'a ParamGroup>,
    is_multipart: bool,
    full_query: &'a [u8],
    gzipped_body: bool,
}

impl Exchange<'_> {
    fn snippet(&self) -> String {
        query::readable_snippet(self.full_query, self.gzipped_body)
    }

    fn describe(&self, message: impl std::fmt::Display) -> String {
        format!(
            "{message}; scope_id: {}; user: {:?}; backend_user: {:?}; node: {:?}; query: {:?}",
            self.scope.id_hex(),
            self.scope.user().name(),
            self.scope.backend_user().name(),
            self.scope.node().host(),
            self.snippet(),
        )
    }
}

struct UpstreamResponse {
    status: StatusCode,
    content_type: String,
    content_encoding: String,
    payload: Bytes,
}

enum DispatchError {
    /// Connect failure or upstream 502, after exhausting the retry
    /// budget. The offending nodes have been penalized.
    Unreachable(String),
    /// The execution deadline fired; the remote query has been killed.
    Deadline(Duration),
}

/// One proxied round trip with node retry and the execution deadline.
///
/// Client disconnects cancel this future outright; the surrounding
/// [`CancelGuard`] then emits the kill-query and the 499 bookkeeping.
async fn dispatch(exchange: &Exchange<'_>) -> Result<UpstreamResponse, DispatchError> {
    let scope = exchange.scope;
    let budget = scope.cluster().retry_number;
    let cap = scope.execution_deadline();
    let deadline_at = Instant::now() + cap;
    let client = &exchange.state.client;
    let mut attempt = 0;

    loop {
        let request = match scope.build_upstream_request(
            &exchange.method,
            exchange.params,
            &exchange.headers,
            exchange.body.clone(),
            exchange.param_group,
            exchange.is_multipart,
        ) {
            Ok(request) => request,
            Err(err) => return Err(DispatchError::Unreachable(err.to_string())),
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let outcome = tokio::time::timeout(remaining, client.request(request)).await;
        let failure = match outcome {
            Err(_) => {
                scope.node().penalize();
                scope.kill_query(client).await;
                metrics::record_timeout(scope);
                return Err(DispatchError::Deadline(cap));
            }
            Ok(Err(err)) => err.to_string(),
            Ok(Ok(response)) if response.status() == StatusCode::BAD_GATEWAY => {
                "upstream responded with 502".to_string()
            }
            Ok(Ok(response)) => {
                let status = response.status();
                let content_type = header_string(response.headers(), http::header::CONTENT_TYPE);
                let content_encoding =
                    header_string(response.headers(), http::header::CONTENT_ENCODING);
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                let collected =
                    tokio::time::timeout(remaining, response.into_body().collect()).await;
                match collected {
                    Err(_) => {
                        scope.node().penalize();
                        scope.kill_query(client).await;
                        metrics::record_timeout(scope);
                        return Err(DispatchError::Deadline(cap));
                    }
                    Ok(Err(err)) => err.to_string(),
                    Ok(Ok(collected)) => {
                        return Ok(UpstreamResponse {
                            status,
                            content_type,
                            content_encoding,
                            payload: collected.to_bytes(),
                        })
                    }
                }
            }
        };

        // Upstream unreachable: penalize and maybe try another node.
        scope.node().penalize();
        warn!(
            scope = %scope.id_hex(),
            node = %scope.node().host(),
            attempt,
            error = %failure,
            "upstream dispatch failed"
        );
        if attempt >= budget {
            return Err(DispatchError::Unreachable(failure));
        }
        attempt += 1;
        metrics::record_retry(scope);
        scope.reselect_node();
    }
}

fn header_string(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn upstream_to_response(upstream: UpstreamResponse) -> Response<Body> {
    let mut response = Response::new(body_from(upstream.payload));
    *response.status_mut() = upstream.status;
    if !upstream.content_type.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&upstream.content_type) {
            response.headers_mut().insert(http::header::CONTENT_TYPE, value);
        }
    }
    if !upstream.content_encoding.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&upstream.content_encoding) {
            response
                .headers_mut()
                .insert(http::header::CONTENT_ENCODING, value);
        }
    }
    response
}

fn dispatch_error_response(exchange: &Exchange<'_>, err: DispatchError) -> Response<Body> {
    match err {
        DispatchError::Unreachable(message) => text_response(
            StatusCode::BAD_GATEWAY,
            exchange.describe(format!("cannot reach backend: {message}")),
        ),
        DispatchError::Deadline(cap) => text_response(
            StatusCode::GATEWAY_TIMEOUT,
            exchange.describe(format!(
                "timeout for query execution exceeded: max_execution_time {cap:?}"
            )),
        ),
    }
}

async fn direct_dispatch(exchange: &Exchange<'_>) -> Response<Body> {
    let cancel = CancelGuard::arm(exchange);
    let result = dispatch(exchange).await;
    cancel.disarm();
    match result {
        Ok(upstream) => upstream_to_response(upstream),
        Err(err) => dispatch_error_response(exchange, err),
    }
}

async fn cached_dispatch(
    exchange: &Exchange<'_>,
    cache: &Arc<ResponseCache>,
) -> Response<Body> {
    let key = build_cache_key(exchange, cache);
    let lookup = match cache.get(&key).await {
        Ok(lookup) => lookup,
        Err(err) => {
            // A broken cache must not take queries down with it.
            warn!(cache = cache.name(), %err, "cache lookup failed, dispatching directly");
            return direct_dispatch(exchange).await;
        }
    };

    match lookup {
        Lookup::Hit(entry) => {
            metrics::record_cache_hit(cache.name(), exchange.scope);
            upstream_to_response(UpstreamResponse {
                status: StatusCode::OK,
                content_type: entry.content_type.clone(),
                content_encoding: entry.content_encoding.clone(),
                payload: entry.payload,
            })
        }
        Lookup::Failed(message) => {
            metrics::record_cache_hit(cache.name(), exchange.scope);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        Lookup::GraceExpired => text_response(
            StatusCode::REQUEST_TIMEOUT,
            "no result found during grace time period",
        ),
        Lookup::Miss(guard) => {
            metrics::record_cache_miss(cache.name(), exchange.scope);
            let cancel = CancelGuard::arm(exchange);
            let result = dispatch(exchange).await;
            cancel.disarm();
            match result {
                Ok(upstream) if upstream.status == StatusCode::OK => {
                    if exchange.scope.is_cancelled() {
                        // The backend may already have received a
                        // KILL QUERY; the assembled bytes cannot be
                        // trusted.
                        let _ = guard.rollback("query execution was interrupted".into()).await;
                    } else if let Err(err) = guard
                        .commit(
                            upstream.payload.clone(),
                            upstream.content_type.clone(),
                            upstream.content_encoding.clone(),
                        )
                        .await
                    {
                        warn!(cache = cache.name(), %err, "cache commit failed");
                    }
                    upstream_to_response(upstream)
                }
                Ok(upstream) => {
                    let message = String::from_utf8_lossy(&upstream.payload).into_owned();
                    if let Err(err) = guard.rollback(message).await {
                        warn!(cache = cache.name(), %err, "cache rollback failed");
                    }
                    upstream_to_response(upstream)
                }
                Err(err) => {
                    let response = dispatch_error_response(exchange, err);
                    let message = format!("upstream error, status {}", response.status());
                    if let Err(err) = guard.rollback(message).await {
                        warn!(cache = cache.name(), %err, "cache rollback failed");
                    }
                    response
                }
            }
        }
    }
}

fn build_cache_key(exchange: &Exchange<'_>, cache: &ResponseCache) -> CacheKey {
    let params = exchange.params;
    let group_digest = exchange
        .param_group
        .map(|group| {
            let joined = group
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            format!("{:016x}", xxh3_64(joined.as_bytes()))
        })
        .unwrap_or_default();
    let credentials = format!(
        "{}:{}",
        exchange.scope.user().name(),
        exchange.scope.backend_user().name()
    );

    CacheKey {
        query: exchange.full_query.to_vec(),
        accept_encoding: header_string(&exchange.headers, http::header::ACCEPT_ENCODING),
        default_format: param_string(params, "default_format"),
        database: param_string(params, "database"),
        compress: param_string(params, "compress"),
        enable_http_compression: param_string(params, "enable_http_compression"),
        namespace: cache.name().to_string(),
        extremes: param_string(params, "extremes"),
        max_result_rows: param_string(params, "max_result_rows"),
        result_overflow_mode: param_string(params, "result_overflow_mode"),
        param_group_hash: group_digest,
        credentials_hash: format!("{:016x}", xxh3_64(credentials.as_bytes())),
    }
}

fn param_string(params: &[(String, String)], name: &str) -> String {
    find_param(params, name).unwrap_or_default().to_string()
}

/// Observes client disconnects.
///
/// hyper drops the request future when the connection goes away, so an
/// armed guard dropping mid-dispatch means the client is gone: mark
/// the scope cancelled, account a 499, and kill the remote query from
/// a detached task (the request task is being torn down).
struct CancelGuard {
    scope: Arc<Scope>,
    client: UpstreamClient,
    armed: bool,
}

impl CancelGuard {
    fn arm(exchange: &Exchange<'_>) -> Self {
        Self {
            scope: Arc::clone(exchange.scope),
            client: exchange.state.client.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.scope.mark_cancelled();
        metrics::record_client_gone(&self.scope);
        metrics::record_status(&self.scope, 499, self.scope.started());
        warn!(
            scope = %self.scope.id_hex(),
            user = self.scope.user().name(),
            "client disconnected, killing remote query"
        );
        let scope = Arc::clone(&self.scope);
        let client = self.client.clone();
        tokio::spawn(async move {
            scope.kill_query(&client).await;
        });
    }
}
