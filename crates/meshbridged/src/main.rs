//! meshbridged - MeshCore bridge daemon
//!
//! Connects to a meshcore radio device (real or simulated), normalizes and
//! stores its events, fans them out to webhooks, and serves an HTTP query
//! and command API.

use clap::Parser;
use meshbridged::config::Config;
use meshbridged::supervisor::Supervisor;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("meshbridged v{} starting", env!("CARGO_PKG_VERSION"));

    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => std::sync::Arc::new(supervisor),
        Err(e) => {
            error!("failed to initialize supervisor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("received shutdown signal");
            supervisor.shutdown();
        }
    });

    if let Err(e) = supervisor.run().await {
        error!("meshbridged exited with error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
