//! Listener lifecycle: accept loop, per-connection serving, config
//! generations and reload.

use crate::config::{Config, ConfigError};
use crate::proxy::{handle, AppState};
use crate::state::Generation;
use crate::{metrics, UpstreamClient};
use arc_swap::ArcSwap;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A running proxy listener.
pub struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Server {
    /// Validates the config, installs the first generation and starts
    /// accepting connections.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let client: UpstreamClient =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build_http();
        let generation = Generation::apply(&config, client.clone())?;
        let state = Arc::new(AppState {
            generation: ArcSwap::from_pointee(generation),
            client,
            prometheus: metrics::prometheus_handle(),
            listener_is_tls: false,
        });

        let listener = TcpListener::bind(&config.server.http.listen_addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        info!(%addr, "proxy listening");

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!(%err, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    serve_connection(state, stream, peer, addr).await;
                });
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    /// Address the listener is bound to; useful with an ephemeral
    /// port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Snapshot of the currently installed config generation. Useful
    /// for inspecting the live topology (node health, penalties,
    /// connection counts).
    pub fn generation(&self) -> Arc<Generation> {
        self.state.generation.load_full()
    }

    /// Validates and installs a new config generation atomically. On
    /// any error the old generation stays untouched. In-flight
    /// requests keep running against the generation they started with.
    pub fn reload(&self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;
        let next = Generation::apply(config, self.state.client.clone())?;
        let previous = self.state.generation.swap(Arc::new(next));
        previous.stop();
        info!("config reloaded");
        Ok(())
    }

    /// Stops accepting connections and shuts down the current
    /// generation's background tasks.
    pub fn stop(&self) {
        self.state.generation.load().stop();
        self.shutdown.cancel();
        info!("proxy stopped");
    }
}

async fn serve_connection(
    state: Arc<AppState>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
) {
    let service = tower::service_fn(move |request| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle(state, request, peer, local).await) }
    });
    let service = TowerToHyperService::new(service);
    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(%peer, %err, "connection closed with error");
    }
}
