use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use passage_agent::config::AgentConfig;
use passage_agent::connection;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::parse();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .init();

    info!("Starting tunnel agent");
    info!("  Server: {}", config.server_url);
    info!(
        "  Token: {}...",
        &config.auth_token[..config.auth_token.len().min(10)]
    );
    info!("  Origin: {}", config.origin_addr());
    if !config.path_prefix.is_empty() {
        info!("  Path prefix: {}", config.path_prefix);
    }
    if config.insecure {
        warn!("Certificate verification toward the local origin is DISABLED");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match connection::run(config, shutdown_rx).await {
        Ok(()) => {
            info!("Agent stopped");
            Ok(())
        }
        Err(err) => {
            error!("Fatal: {err}");
            // Nonzero exit for fatal failures such as rejected credentials.
            Err(err.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
