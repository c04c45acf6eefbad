//! Library-neutral WebSocket frames.
//!
//! Inbound sockets are `axum` WebSockets while the upstream is a
//! `tokio-tungstenite` client, and the two crates carry distinct message
//! types. [`Frame`] is the unit the pumps move between them. Ping and pong
//! frames are answered per hop by each library and are never relayed.
//!
//! Payloads are reference-counted [`Bytes`], so converting a message into a
//! frame and back never copies its body.

use axum::extract::ws::{self, Message as ClientMessage};
use bytes::Bytes;
use tokio_tungstenite::tungstenite::{Message as UpstreamMessage, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::{CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Largest close reason that fits a control frame (125 bytes minus the
/// two-byte status code).
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A data or close frame in transit through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text message.
    Text(Utf8Bytes),
    /// Binary message.
    Binary(Bytes),
    /// Close frame with an optional status.
    Close(Option<CloseReason>),
}

/// Close status code and reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    code: u16,
    reason: String,
}

impl CloseReason {
    /// Creates a close reason, truncating `reason` to
    /// [`MAX_CLOSE_REASON_BYTES`] on a character boundary.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_BYTES {
            let mut end = MAX_CLOSE_REASON_BYTES;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// `1000 Normal Closure` with an empty reason.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// Returns the status code.
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// Returns the reason text.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns `true` if an endpoint may put this code on the wire.
    ///
    /// 1004, 1005, 1006 and 1015 are reserved for local reporting, and
    /// codes outside the registered and private ranges are invalid.
    #[must_use]
    pub const fn is_sendable(&self) -> bool {
        matches!(self.code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Returns this reason when it is sendable, a normal closure otherwise.
    #[must_use]
    pub fn into_sendable(self) -> Self {
        if self.is_sendable() {
            self
        } else {
            Self::normal()
        }
    }
}

impl Frame {
    /// Creates a text frame.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(Utf8Bytes::from(text.into()))
    }

    /// Creates a binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Converts a client message, dropping ping and pong frames.
    #[must_use]
    pub fn from_client(msg: ClientMessage) -> Option<Self> {
        match msg {
            ClientMessage::Text(text) => Some(Self::Text(text_from_client(text))),
            ClientMessage::Binary(data) => Some(Self::Binary(data)),
            ClientMessage::Close(frame) => Some(Self::Close(
                frame.map(|f| CloseReason::new(f.code, f.reason.as_str())),
            )),
            ClientMessage::Ping(_) | ClientMessage::Pong(_) => None,
        }
    }

    /// Converts into a message for the client socket.
    #[must_use]
    pub fn into_client(self) -> ClientMessage {
        match self {
            Self::Text(text) => ClientMessage::Text(text_into_client(text)),
            Self::Binary(data) => ClientMessage::Binary(data),
            Self::Close(reason) => ClientMessage::Close(reason.map(|r| ws::CloseFrame {
                code: r.code,
                reason: r.reason.into(),
            })),
        }
    }

    /// Converts an upstream message, dropping control and raw frames.
    #[must_use]
    pub fn from_upstream(msg: UpstreamMessage) -> Option<Self> {
        match msg {
            UpstreamMessage::Text(text) => Some(Self::Text(text)),
            UpstreamMessage::Binary(data) => Some(Self::Binary(data)),
            UpstreamMessage::Close(frame) => Some(Self::Close(
                frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.as_str())),
            )),
            UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {
                None
            }
        }
    }

    /// Converts into a message for the upstream socket.
    #[must_use]
    pub fn into_upstream(self) -> UpstreamMessage {
        match self {
            Self::Text(text) => UpstreamMessage::Text(text),
            Self::Binary(data) => UpstreamMessage::Binary(data),
            Self::Close(reason) => UpstreamMessage::Close(reason.map(|r| UpstreamCloseFrame {
                code: CloseCode::from(r.code),
                reason: r.reason.into(),
            })),
        }
    }

    /// Returns a log preview of at most `max_chars` characters.
    ///
    /// Binary payloads are summarised by length.
    #[must_use]
    pub fn preview(&self, max_chars: usize) -> String {
        match self {
            Self::Text(text) => match text.char_indices().nth(max_chars) {
                Some((end, _)) => format!("{}...", text.get(..end).unwrap_or_default()),
                None => text.to_string(),
            },
            Self::Binary(data) => format!("<{} bytes>", data.len()),
            Self::Close(Some(reason)) => format!("<close {} {}>", reason.code, reason.reason),
            Self::Close(None) => "<close>".to_string(),
        }
    }
}

// Both sides already hold validated UTF-8, so the checks below only rescan
// the shared buffer. The lossy branches are unreachable in practice.

fn text_from_client(text: ws::Utf8Bytes) -> Utf8Bytes {
    let bytes = Bytes::from(text);
    Utf8Bytes::try_from(bytes.clone())
        .unwrap_or_else(|_| Utf8Bytes::from(String::from_utf8_lossy(&bytes).into_owned()))
}

fn text_into_client(text: Utf8Bytes) -> ws::Utf8Bytes {
    let bytes = Bytes::from(text);
    ws::Utf8Bytes::try_from(bytes.clone())
        .unwrap_or_else(|_| ws::Utf8Bytes::from(String::from_utf8_lossy(&bytes).into_owned()))
}
