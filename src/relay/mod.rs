//! Relay core: upstream connector, message pumps and the per-connection
//! session that ties them together.

pub mod pump;
pub mod session;
pub mod session_id;
pub mod upstream;

pub use pump::{Direction, PumpOutcome, PumpReport};
pub use session::{RelaySession, SessionState};
pub use session_id::SessionId;
pub use upstream::{UpstreamSocket, connect_upstream};
