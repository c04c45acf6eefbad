//! One-directional message forwarding.
//!
//! A pump reads [`Frame`]s from a source stream and writes each to a
//! destination sink in arrival order, until the source closes, an I/O
//! error occurs, or the owning session cancels it.

use std::fmt;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::ws::frame::{CloseReason, Frame};

/// Direction of a pump, used as its log label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client socket to upstream socket.
    ClientToUpstream,
    /// Upstream socket to client socket.
    UpstreamToClient,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::ClientToUpstream => Self::UpstreamToClient,
            Self::UpstreamToClient => Self::ClientToUpstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client -> upstream"),
            Self::UpstreamToClient => f.write_str("upstream -> client"),
        }
    }
}

/// How a pump terminated.
#[derive(Debug)]
pub enum PumpOutcome {
    /// The source ended or sent a close frame.
    Closed(Option<CloseReason>),
    /// A read or write failed.
    Errored(RelayError),
    /// The session cancelled the pump after its sibling finished.
    Cancelled,
    /// The pump did not stop within the drain timeout and was dropped.
    Abandoned,
}

/// Final report of one pump.
#[derive(Debug)]
pub struct PumpReport {
    /// Direction the pump served.
    pub direction: Direction,
    /// Termination cause.
    pub outcome: PumpOutcome,
    /// Number of messages written to the destination.
    pub forwarded: u64,
}

impl PumpReport {
    /// Report for a pump dropped during draining.
    #[must_use]
    pub const fn abandoned(direction: Direction) -> Self {
        Self {
            direction,
            outcome: PumpOutcome::Abandoned,
            forwarded: 0,
        }
    }
}

/// Forwards frames from `source` to `destination` until termination.
///
/// Cancellation is only observed while waiting for the next source frame;
/// a write already in progress completes or fails before the pump stops.
/// Close frames end the pump without being forwarded; the session decides
/// how the opposite endpoint is closed.
pub async fn pump<S, D>(
    source: &mut S,
    destination: &mut D,
    direction: Direction,
    preview_chars: usize,
    cancel: &CancellationToken,
) -> PumpReport
where
    S: Stream<Item = Result<Frame, RelayError>> + Unpin,
    D: Sink<Frame, Error = RelayError> + Unpin,
{
    let mut forwarded = 0u64;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break PumpOutcome::Cancelled,
            next = source.next() => next,
        };

        let frame = match next {
            None => break PumpOutcome::Closed(None),
            Some(Err(err)) => break PumpOutcome::Errored(err),
            Some(Ok(Frame::Close(reason))) => break PumpOutcome::Closed(reason),
            Some(Ok(frame)) => frame,
        };

        tracing::info!(
            %direction,
            preview = %frame.preview(preview_chars),
            "forwarding message"
        );
        if let Err(err) = destination.send(frame).await {
            break PumpOutcome::Errored(err);
        }
        forwarded += 1;
    };

    match &outcome {
        PumpOutcome::Closed(reason) => tracing::info!(
            %direction,
            forwarded,
            code = reason.as_ref().map(CloseReason::code),
            "connection closed"
        ),
        PumpOutcome::Errored(err) if err.is_teardown_artifact() => {
            tracing::debug!(%direction, forwarded, error = %err, "peer gone during forwarding");
        }
        PumpOutcome::Errored(err) => {
            tracing::error!(%direction, forwarded, error = %err, "forwarding failed");
        }
        PumpOutcome::Cancelled | PumpOutcome::Abandoned => {
            tracing::debug!(%direction, forwarded, "pump stopped");
        }
    }

    PumpReport {
        direction,
        outcome,
        forwarded,
    }
}
