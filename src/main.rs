use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hyperapi::{router, AppState, GatewayConfig, GatewayMetrics};

#[derive(Parser)]
#[command(name = "hyperapi", about = "HTTP reverse-proxy API gateway")]
struct Args {
    /// Address to listen on (e.g. 127.0.0.1:8888); overrides the config file
    #[arg(long)]
    listen: Option<String>,
    /// Path to the YAML configuration file
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Config problems are their own failure class with exit code 3; anything
    // failing later is a runtime fatal (exit 1 via anyhow).
    let config = match GatewayConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("hyperapi: {err}");
            std::process::exit(3);
        }
    };

    let listen = match args.listen.clone().or_else(|| config.listen.clone()) {
        Some(listen) => listen,
        None => {
            eprintln!("hyperapi: no listen address: pass --listen or set `listen` in the config");
            std::process::exit(3);
        }
    };
    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("hyperapi: invalid listen address '{listen}': {err}");
            std::process::exit(3);
        }
    };

    let metrics = Arc::new(GatewayMetrics::new()?);
    let http_client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let state = match AppState::new(&config, http_client, metrics) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("hyperapi: {err}");
            std::process::exit(3);
        }
    };

    info!(%addr, services = state.services().len(), "starting hyperapi");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
