//! ws-relay entry point.
//!
//! Loads configuration, starts the listener and relays until interrupted.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use ws_relay::config::{LogFormat, RelayConfig};
use ws_relay::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = RelayConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // TLS backend for wss:// upstreams
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!(addr = %config.listen_addr, upstream = %config.upstream.url, "starting ws-relay");

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    server::serve(listener, Arc::new(config), server::shutdown_signal()).await?;

    tracing::info!("relay stopped");
    Ok(())
}
