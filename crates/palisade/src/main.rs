use anyhow::Context as _;
use clap::Parser;
use palisade::config::Config;
use palisade::server::Server;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// HTTP reverse proxy and load balancer for columnar analytical
/// databases.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let default_level = if config.log_debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = Server::start(config).await?;

    let mut reload = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = reload.recv() => {
                info!("SIGHUP received, reloading config");
                match Config::from_file(&args.config) {
                    Ok(config) => {
                        if let Err(err) = server.reload(&config) {
                            // A bad reload keeps the old generation.
                            error!(%err, "config reload rejected");
                        }
                    }
                    Err(err) => error!(%err, "cannot read config"),
                }
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    server.stop();
    Ok(())
}
