//! Stub backend and proxy boot utilities.

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use palisade::config::Config;
use palisade::server::Server;
use std::convert::Infallible;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How a stub backend answers a proxied query.
#[derive(Clone, Copy)]
pub enum Reply {
    /// Answer immediately with this status and body.
    Status(u16, &'static str),
    /// Sleep, then answer.
    Delayed(Duration, u16, &'static str),
    /// Never answer (the proxy's deadline must fire).
    Hang,
}

/// One stub backend node. Heartbeats are served on `/ping`; KILL QUERY
/// statements are counted separately and never hit the query counter.
pub struct Upstream {
    pub addr: String,
    pub queries: Arc<AtomicUsize>,
    pub kills: Arc<AtomicUsize>,
}

pub async fn start_upstream<F>(reply: F) -> Upstream
where
    F: Fn(&str) -> Reply + Send + Sync + 'static,
{
    let reply: Arc<dyn Fn(&str) -> Reply + Send + Sync> = Arc::new(reply);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let kills = Arc::new(AtomicUsize::new(0));

    let accept_queries = Arc::clone(&queries);
    let accept_kills = Arc::clone(&kills);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let reply = Arc::clone(&reply);
            let queries = Arc::clone(&accept_queries);
            let kills = Arc::clone(&accept_kills);
            tokio::spawn(async move {
                let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                    let reply = Arc::clone(&reply);
                    let queries = Arc::clone(&queries);
                    let kills = Arc::clone(&kills);
                    async move {
                        let response = answer(&request, &reply, &queries, &kills).await;
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream {
        addr: format!("127.0.0.1:{}", addr.port()),
        queries,
        kills,
    }
}

async fn answer<B>(
    request: &hyper::Request<B>,
    reply: &Arc<dyn Fn(&str) -> Reply + Send + Sync>,
    queries: &AtomicUsize,
    kills: &AtomicUsize,
) -> hyper::Response<Full<Bytes>> {
    if request.uri().path() == "/ping" {
        return plain(200, "Ok.\n");
    }

    let query = request
        .uri()
        .query()
        .map(|raw| {
            url::form_urlencoded::parse(raw.as_bytes())
                .find(|(key, _)| key == "query")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    if query.starts_with("KILL QUERY") {
        kills.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        return plain(200, "Ok.\n");
    }

    queries.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    match reply(&query) {
        Reply::Status(status, body) => plain(status, body),
        Reply::Delayed(delay, status, body) => {
            tokio::time::sleep(delay).await;
            plain(status, body)
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            plain(200, "too late")
        }
    }
}

fn plain(status: u16, body: &'static str) -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

/// Boots a proxy from YAML and waits for the first heartbeat round to
/// mark the nodes active.
pub async fn start_proxy(yaml: &str) -> Server {
    let config = Config::from_yaml(yaml).unwrap();
    let server = Server::start(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    server
}

/// Minimal one-node config with the stock `default`/`qwerty` user.
pub fn basic_yaml(upstream: &str) -> String {
    format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{upstream}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
"#
    )
}

pub fn proxy_url(server: &Server, query: &str) -> String {
    format!("http://{}/?query={query}", server.addr())
}
