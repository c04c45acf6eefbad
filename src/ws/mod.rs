//! WebSocket layer: inbound upgrade handling and the frame type shared by
//! both socket libraries.

pub mod frame;
pub mod handler;
