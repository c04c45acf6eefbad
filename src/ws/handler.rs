//! Axum WebSocket upgrade handler.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;

use crate::app_state::AppState;
use crate::relay::RelaySession;

/// `GET /*`: upgrades the HTTP connection and hands the socket to a new
/// [`RelaySession`].
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session = RelaySession::new(remote, Arc::clone(&state.config));
    let session_id = session.id();

    ws.on_failed_upgrade(move |err| {
        tracing::warn!(%session_id, %remote, error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| session.run(socket))
}
