use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use runsync_devserver::{API_PREFIX, DevServer, DevServerConfig};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runsync-devserver")]
#[command(about = "In-memory run API with an SSE event stream")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:8055")]
    listen: SocketAddr,
    /// Token required on REST calls (bearer) and on the event stream (`?token=`).
    #[arg(long, env = "RUNSYNC_TOKEN")]
    token: Option<String>,
    /// Milliseconds between scripted events of a started run; 0 disables the script.
    #[arg(long, default_value_t = 1500)]
    step_interval_ms: u64,
    #[arg(long, default_value_t = 10)]
    keep_alive_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let server = DevServer::new(DevServerConfig {
        token: cli.token.filter(|token| !token.trim().is_empty()),
        step_interval: (cli.step_interval_ms > 0)
            .then(|| Duration::from_millis(cli.step_interval_ms)),
        keep_alive: Duration::from_secs(cli.keep_alive_secs.max(1)),
    });

    let app = server
        .router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    info!(listen = %cli.listen, prefix = API_PREFIX, "runsync-devserver listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
