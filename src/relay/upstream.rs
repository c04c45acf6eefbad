//! Outbound connection to the fixed upstream endpoint.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, http};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::UpstreamConfig;
use crate::error::RelayError;

/// An open upstream WebSocket.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens one upstream WebSocket with the configured headers attached to
/// the upgrade request.
///
/// The handshake is bounded by [`UpstreamConfig::connect_timeout`]. There
/// is no retry; a failure is final for the calling session.
///
/// # Errors
///
/// - [`RelayError::HandshakeRejected`] if the upstream answers with a
///   non-101 status.
/// - [`RelayError::ConnectTimeout`] if the handshake does not finish in
///   time.
/// - [`RelayError::Connect`] for any other network, TLS or protocol
///   failure.
pub async fn connect_upstream(config: &UpstreamConfig) -> Result<UpstreamSocket, RelayError> {
    let request = build_request(config)?;

    let (socket, response) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| RelayError::ConnectTimeout(config.connect_timeout))?
        .map_err(connect_error)?;

    tracing::info!(
        url = %config.url,
        status = response.status().as_u16(),
        "connected to upstream"
    );
    Ok(socket)
}

fn build_request(config: &UpstreamConfig) -> Result<http::Request<()>, RelayError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| RelayError::Config(format!("UPSTREAM_URL: {e}")))?;

    let headers = request.headers_mut();
    for (name, value) in &config.headers {
        headers.append(name.clone(), value.clone());
    }
    Ok(request)
}

fn connect_error(err: tungstenite::Error) -> RelayError {
    match err {
        tungstenite::Error::Http(response) => RelayError::HandshakeRejected {
            status: response.status().as_u16(),
        },
        other => RelayError::Connect(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::UpstreamCredentials;

    fn config(url: &str) -> UpstreamConfig {
        let creds = UpstreamCredentials {
            auth_token: "t0k".to_string(),
            protocol_version: "1".to_string(),
            device_id: "dev".to_string(),
            client_id: "cli".to_string(),
        };
        let Ok(config) = UpstreamConfig::new(url, creds) else {
            panic!("valid upstream config");
        };
        config
    }

    #[test]
    fn request_carries_configured_headers() {
        let Ok(request) = build_request(&config("ws://127.0.0.1:9/v1/")) else {
            panic!("request should build");
        };
        let headers = request.headers();
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer t0k")
        );
        assert_eq!(headers.get("device-id").and_then(|v| v.to_str().ok()), Some("dev"));
        assert_eq!(headers.get("client-id").and_then(|v| v.to_str().ok()), Some("cli"));
        assert_eq!(headers.get("protocol-version").and_then(|v| v.to_str().ok()), Some("1"));
        assert!(headers.get("sec-websocket-key").is_some());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        drop(listener);

        let result = connect_upstream(&config(&format!("ws://{addr}/"))).await;
        let Err(err) = result else {
            panic!("connect should fail");
        };
        assert!(matches!(err, RelayError::Connect(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        // Accept TCP but never answer the upgrade request.
        let hold = tokio::spawn(async move {
            let accepted = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(accepted);
        });

        let mut cfg = config(&format!("ws://{addr}/"));
        cfg.connect_timeout = Duration::from_millis(200);
        let Err(err) = connect_upstream(&cfg).await else {
            panic!("connect should time out");
        };
        assert!(matches!(err, RelayError::ConnectTimeout(_)), "got {err:?}");
        hold.abort();
    }
}
