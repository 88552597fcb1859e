//! beacond - replicated rendezvous directory daemon
//!
//! Runs as a standalone peer, as a fan-out parent holding the store for
//! several child overlay identities, or as one of those children.

use beacond::config::{Config, LogFormat};
use beacond::gossip::ReplicationOutcome;
use beacond::server::Server;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_directive()))
        .unwrap_or_else(|_| EnvFilter::new("beacond=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "beacond v{} - replicated rendezvous directory",
        env!("CARGO_PKG_VERSION")
    );

    let server = Server::new(config);

    // Install signal handler
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    match server.run().await {
        Ok(ReplicationOutcome::Shutdown) => ExitCode::SUCCESS,
        Ok(ReplicationOutcome::Isolated) => {
            warn!("Overlay isolated, exiting");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
