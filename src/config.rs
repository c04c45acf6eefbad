//! Relay configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). The configuration is resolved once at
//! startup and shared read-only with every session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Uri};

use crate::error::RelayError;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";
const DEFAULT_UPSTREAM_URL: &str = "wss://api.tenclass.net/xiaozhi/v1/";

/// Top-level relay configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address the listener binds to (e.g. `0.0.0.0:8765`).
    pub listen_addr: SocketAddr,

    /// Upstream endpoint and handshake settings.
    pub upstream: UpstreamConfig,

    /// Upper bound on waiting for the second pump, and on each endpoint's
    /// closing handshake, during teardown.
    pub drain_timeout: Duration,

    /// Number of characters of each forwarded message written to the log.
    pub preview_chars: usize,

    /// Log output format.
    pub log_format: LogFormat,
}

/// Upstream endpoint settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` URL of the upstream.
    pub url: String,

    /// Headers attached to every upgrade request, in order.
    pub headers: Vec<(HeaderName, HeaderValue)>,

    /// Upper bound on the upstream handshake.
    pub connect_timeout: Duration,
}

/// Static credentials injected into the upstream handshake.
#[derive(Debug, Clone)]
pub struct UpstreamCredentials {
    /// Bearer token sent as `Authorization: Bearer <token>`.
    pub auth_token: String,
    /// Sent as `Protocol-Version`.
    pub protocol_version: String,
    /// Sent as `Device-Id`.
    pub device_id: String,
    /// Sent as `Client-Id`.
    pub client_id: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl UpstreamCredentials {
    /// Builds the ordered upgrade headers.
    ///
    /// The authorization value is marked sensitive so it is redacted from
    /// `Debug` output.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if any value is not a valid header
    /// value.
    pub fn into_headers(self) -> Result<Vec<(HeaderName, HeaderValue)>, RelayError> {
        let mut auth = header_value("UPSTREAM_AUTH_TOKEN", &format!("Bearer {}", self.auth_token))?;
        auth.set_sensitive(true);

        Ok(vec![
            (AUTHORIZATION, auth),
            (
                HeaderName::from_static("protocol-version"),
                header_value("UPSTREAM_PROTOCOL_VERSION", &self.protocol_version)?,
            ),
            (
                HeaderName::from_static("device-id"),
                header_value("UPSTREAM_DEVICE_ID", &self.device_id)?,
            ),
            (
                HeaderName::from_static("client-id"),
                header_value("UPSTREAM_CLIENT_ID", &self.client_id)?,
            ),
        ])
    }
}

impl UpstreamConfig {
    /// Creates an upstream configuration with the default 10 s connect
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if `url` is not a `ws://` or `wss://`
    /// URL, or if a credential is not a valid header value.
    pub fn new(url: impl Into<String>, credentials: UpstreamCredentials) -> Result<Self, RelayError> {
        let url = url.into();
        validate_ws_url(&url)?;
        Ok(Self {
            url,
            headers: credentials.into_headers()?,
            connect_timeout: Duration::from_secs(10),
        })
    }
}

impl RelayConfig {
    /// Creates a configuration with default timeouts, preview length and
    /// log format.
    #[must_use]
    pub fn new(listen_addr: SocketAddr, upstream: UpstreamConfig) -> Self {
        Self {
            listen_addr,
            upstream,
            drain_timeout: Duration::from_millis(2_000),
            preview_chars: 100,
            log_format: LogFormat::Pretty,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set. Calls
    /// `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if `LISTEN_ADDR` is not a socket
    /// address, `UPSTREAM_URL` is not a WebSocket URL, or a credential is
    /// not a valid header value.
    pub fn from_env() -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = env_or("LISTEN_ADDR", DEFAULT_LISTEN_ADDR)
            .parse()
            .map_err(|e| RelayError::Config(format!("LISTEN_ADDR: {e}")))?;

        let credentials = UpstreamCredentials {
            auth_token: env_or("UPSTREAM_AUTH_TOKEN", "test_token"),
            protocol_version: env_or("UPSTREAM_PROTOCOL_VERSION", "1"),
            device_id: env_or("UPSTREAM_DEVICE_ID", "d4:d8:53:70:88:94"),
            client_id: env_or("UPSTREAM_CLIENT_ID", "9cd8b05e-bbae-478e-8ea9-58bc908fb16a"),
        };
        let mut upstream =
            UpstreamConfig::new(env_or("UPSTREAM_URL", DEFAULT_UPSTREAM_URL), credentials)?;
        upstream.connect_timeout =
            Duration::from_secs(parse_env("UPSTREAM_CONNECT_TIMEOUT_SECS", 10));

        let mut config = Self::new(listen_addr, upstream);
        config.drain_timeout = Duration::from_millis(parse_env("DRAIN_TIMEOUT_MS", 2_000));
        config.preview_chars = parse_env("LOG_PREVIEW_CHARS", 100);
        config.log_format = parse_log_format(std::env::var("LOG_FORMAT").ok().as_deref());

        Ok(config)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Accepts `"json"` (case-insensitive); anything else is pretty output.
fn parse_log_format(value: Option<&str>) -> LogFormat {
    match value {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

fn header_value(key: &str, value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value).map_err(|e| RelayError::Config(format!("{key}: {e}")))
}

fn validate_ws_url(url: &str) -> Result<(), RelayError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| RelayError::Config(format!("UPSTREAM_URL: {e}")))?;
    match uri.scheme_str() {
        Some("ws" | "wss") if uri.host().is_some() => Ok(()),
        _ => Err(RelayError::Config(format!(
            "UPSTREAM_URL: expected a ws:// or wss:// URL, got {url}"
        ))),
    }
}
