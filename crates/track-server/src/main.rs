//! # Livetrack Server
//!
//! Realtime order-tracking server: live connection registry, topic groups
//! for orders, restaurants, and couriers, and location fan-out.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! livetrack
//!
//! # Run with environment variables
//! LIVETRACK_PORT=8080 LIVETRACK_HOST=0.0.0.0 livetrack
//! ```

mod config;
mod handlers;
mod metrics;
mod protocol;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livetrack=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Livetrack server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
