//! Listener and dispatcher.
//!
//! Every accepted connection is upgraded on any path and served by its own
//! [`crate::relay::RelaySession`]. Sessions share nothing but the
//! read-only configuration, so one failing session never affects another.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::ws::handler::ws_handler;

/// Builds the router: every path accepts a WebSocket upgrade.
pub fn build_router(config: Arc<RelayConfig>) -> Router {
    Router::new()
        .fallback(ws_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { config })
}

/// Serves relay sessions on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`RelayError::Io`] if the listener fails.
pub async fn serve<F>(
    listener: TcpListener,
    config: Arc<RelayConfig>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        addr = ?listener.local_addr().ok(),
        upstream = %config.upstream.url,
        "relay listening"
    );
    let app = build_router(config);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
