//! Relay error types with WebSocket close code mapping.
//!
//! [`RelayError`] is the central error type for the relay. Each variant
//! maps to the close code the session uses when the error ends a client
//! connection.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::relay::Direction;

/// Normal closure (RFC 6455 §7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;

/// Abnormal closure reported when the relay itself fails: the server hit an
/// unexpected condition (RFC 6455 `1011 Internal Error`).
pub const CLOSE_ABNORMAL: u16 = 1011;

/// Relay error enum with close code mapping.
///
/// # Taxonomy
///
/// | Variant group                                  | Phase       | Close code |
/// |------------------------------------------------|-------------|------------|
/// | `Config`, `Io`                                 | start-up    | n/a        |
/// | `HandshakeRejected`, `Connect`, `ConnectTimeout` | Connecting  | 1011       |
/// | `PeerGone`, `Transport`                        | Relaying    | 1011       |
/// | `Session`                                      | any         | 1011       |
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The upstream answered the upgrade request with a non-101 status.
    #[error("upstream rejected handshake with status {status}")]
    HandshakeRejected {
        /// HTTP status code returned by the upstream.
        status: u16,
    },

    /// The upstream could not be reached (DNS, TCP, TLS, protocol).
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The upstream handshake did not complete in time.
    #[error("upstream handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Read or write failed because the peer was already gone. Expected
    /// during teardown.
    #[error("{direction}: peer connection already closed")]
    PeerGone {
        /// Direction of the pump that observed the failure.
        direction: Direction,
    },

    /// Read or write failed with a genuine transport error.
    #[error("{direction}: transport error: {reason}")]
    Transport {
        /// Direction of the pump that observed the failure.
        direction: Direction,
        /// Underlying failure description.
        reason: String,
    },

    /// Unexpected failure inside a session.
    #[error("session failed: {0}")]
    Session(String),

    /// Listener socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Returns the close code used when this error terminates a client.
    #[must_use]
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::Config(_)
            | Self::HandshakeRejected { .. }
            | Self::Connect(_)
            | Self::ConnectTimeout(_)
            | Self::PeerGone { .. }
            | Self::Transport { .. }
            | Self::Session(_)
            | Self::Io(_) => CLOSE_ABNORMAL,
        }
    }

    /// Returns `true` when the failure only reflects the other side having
    /// gone away. Used to pick the log level, never for control flow.
    #[must_use]
    pub const fn is_teardown_artifact(&self) -> bool {
        matches!(self, Self::PeerGone { .. })
    }

    /// Classifies an error raised by the upstream socket.
    #[must_use]
    pub fn from_upstream(direction: Direction, err: tungstenite::Error) -> Self {
        if is_closed_socket(&err) {
            Self::PeerGone { direction }
        } else {
            Self::Transport {
                direction,
                reason: err.to_string(),
            }
        }
    }

    /// Classifies an error raised by the client socket.
    ///
    /// `axum` boxes the underlying tungstenite error, so the source chain is
    /// searched for a closed-socket error or an I/O disconnect.
    #[must_use]
    pub fn from_client(direction: Direction, err: axum::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(cause) = source {
            let gone = if let Some(ws) = cause.downcast_ref::<tungstenite::Error>() {
                is_closed_socket(ws)
            } else if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                is_disconnect(io.kind())
            } else {
                false
            };
            if gone {
                return Self::PeerGone { direction };
            }
            source = cause.source();
        }
        Self::Transport {
            direction,
            reason: err.to_string(),
        }
    }
}

fn is_closed_socket(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => true,
        tungstenite::Error::Io(io) => is_disconnect(io.kind()),
        _ => false,
    }
}

fn is_disconnect(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}
