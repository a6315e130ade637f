use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use passage_edge::config::EdgeConfig;
use passage_edge::server::EdgeServer;
use passage_edge::{tls, EdgeState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EdgeConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let tls_acceptor = config
        .tls_paths()
        .map(|(cert, key)| tls::build_acceptor(cert, key))
        .transpose()
        .context("Failed to load TLS configuration")?;

    let state = EdgeState::new(&config);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = EdgeServer::bind(addr, tls_acceptor, state)
        .await
        .context("Failed to start edge server")?;

    tokio::select! {
        result = server.serve() => result.context("Edge server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
