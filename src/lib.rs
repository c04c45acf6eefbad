//! # ws-relay
//!
//! Transparent bidirectional WebSocket relay.
//!
//! Each inbound client WebSocket is paired with a fresh outbound WebSocket
//! to one fixed upstream endpoint, opened with static credentials in the
//! upgrade headers. Messages flow both ways unchanged until either side
//! closes or fails, then both connections are closed.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)
//!     │
//!     ├── Listener / upgrade handler (server, ws/)
//!     │
//!     ├── RelaySession (relay/session)
//!     │     ├── Upstream connector (relay/upstream)
//!     │     ├── Pump client -> upstream (relay/pump)
//!     │     └── Pump upstream -> client (relay/pump)
//!     │
//!     └── Upstream (tokio-tungstenite)
//! ```

pub mod app_state;
pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod ws;
