//! # Herald Server
//!
//! Pusher-compatible realtime broadcasting server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (herald.toml in the working directory)
//! herald
//!
//! # Run with a custom config
//! HERALD_CONFIG=/path/to/herald.toml herald
//!
//! # Override settings with environment variables
//! HERALD__PORT=6001 HERALD__REPLICATION__MODE=redis herald
//! ```

mod api;
mod config;
mod handlers;
mod metrics;
mod tasks;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,tenvis_herald_core=info,tenvis_herald_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        apps = config.apps.len(),
        replication = ?config.replication.mode,
        "Starting Herald server on {}:{}",
        config.host,
        config.port
    );

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
