//! Relay session: one client socket paired with one upstream socket.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──connect failed──────────────────────────┐
//!     │                                                 │
//!     └─► Relaying ──first pump done──► Draining ──► Closed
//! ```
//!
//! Both pumps are polled concurrently inside the session task, so neither
//! can outlive the session. The first pump to finish wins the race; the
//! other is cancelled through a per-session [`CancellationToken`] and given
//! at most the drain timeout to stop before it is dropped. Both endpoints
//! are then closed, each exactly once.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::pump::{Direction, PumpOutcome, PumpReport, pump};
use super::session_id::SessionId;
use super::upstream::{UpstreamSocket, connect_upstream};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::ws::frame::{CloseReason, Frame};

/// Phase of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the upstream connection.
    Connecting,
    /// Both pumps running.
    Relaying,
    /// One pump finished; the other is being cancelled.
    Draining,
    /// Both endpoints closed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Relaying => "relaying",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A single client-to-upstream pairing.
///
/// Owns its configuration handle and nothing shared with other sessions.
#[derive(Debug)]
pub struct RelaySession {
    id: SessionId,
    remote: SocketAddr,
    config: Arc<RelayConfig>,
    state: SessionState,
}

impl RelaySession {
    /// Creates a session for a client accepted from `remote`.
    #[must_use]
    pub fn new(remote: SocketAddr, config: Arc<RelayConfig>) -> Self {
        Self {
            id: SessionId::random(),
            remote,
            config,
            state: SessionState::Connecting,
        }
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Runs the session to completion. Never fails: every error ends with
    /// the client connection closed.
    pub async fn run(self, client: WebSocket) {
        let span = tracing::info_span!(
            "relay_session",
            session_id = %self.id,
            remote = %self.remote
        );
        self.drive(client).instrument(span).await;
    }

    async fn drive(mut self, client: WebSocket) {
        tracing::info!("client connected");

        let (client_tx, client_rx) = client.split();
        let mut client_tx = client_sink(client_tx);
        let mut client_rx = client_stream(client_rx);

        let upstream = match connect_upstream(&self.config.upstream).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::error!(url = %self.config.upstream.url, error = %err, "failed to connect to upstream");
                let reason = CloseReason::new(
                    err.close_code(),
                    format!("failed to connect to upstream: {err}"),
                );
                close_endpoint(
                    &mut client_tx,
                    &mut client_rx,
                    reason,
                    self.config.drain_timeout,
                    "client",
                )
                .await;
                self.transition(SessionState::Closed);
                return;
            }
        };

        let (upstream_tx, upstream_rx) = upstream.split();
        let mut upstream_tx = upstream_sink(upstream_tx);
        let mut upstream_rx = upstream_stream(upstream_rx);

        self.bridge(
            &mut client_rx,
            &mut client_tx,
            &mut upstream_rx,
            &mut upstream_tx,
        )
        .await;
        tracing::info!("proxy connection terminated");
    }

    /// Relays between two connected endpoints, then closes both.
    ///
    /// A panic inside either pump is caught here and reported to the client
    /// as `1011` so the endpoints are still closed.
    async fn bridge<CR, CT, UR, UT>(
        &mut self,
        client_rx: &mut CR,
        client_tx: &mut CT,
        upstream_rx: &mut UR,
        upstream_tx: &mut UT,
    ) where
        CR: Stream<Item = Result<Frame, RelayError>> + Unpin,
        CT: Sink<Frame, Error = RelayError> + Unpin,
        UR: Stream<Item = Result<Frame, RelayError>> + Unpin,
        UT: Sink<Frame, Error = RelayError> + Unpin,
    {
        let drain_timeout = self.config.drain_timeout;

        self.transition(SessionState::Relaying);
        let relayed = AssertUnwindSafe(self.relay(client_rx, client_tx, upstream_rx, upstream_tx))
            .catch_unwind()
            .await;

        let (client_reason, upstream_reason) = match relayed {
            Ok((first, second)) => {
                tracing::info!(
                    first = %first.direction,
                    to_upstream = forwarded(&first, &second, Direction::ClientToUpstream),
                    to_client = forwarded(&first, &second, Direction::UpstreamToClient),
                    "relay finished"
                );
                teardown_reasons(&first)
            }
            Err(panic) => {
                let err = RelayError::Session(panic_message(panic.as_ref()));
                tracing::error!(error = %err, "proxy error");
                (
                    CloseReason::new(err.close_code(), format!("proxy error: {err}")),
                    CloseReason::normal(),
                )
            }
        };

        if self.state != SessionState::Draining {
            self.transition(SessionState::Draining);
        }
        tokio::join!(
            close_endpoint(client_tx, client_rx, client_reason, drain_timeout, "client"),
            close_endpoint(
                upstream_tx,
                upstream_rx,
                upstream_reason,
                drain_timeout,
                "upstream"
            ),
        );
        self.transition(SessionState::Closed);
    }

    /// Races the two pumps, cancels the loser and returns both reports,
    /// winner first.
    async fn relay<CR, CT, UR, UT>(
        &mut self,
        client_rx: &mut CR,
        client_tx: &mut CT,
        upstream_rx: &mut UR,
        upstream_tx: &mut UT,
    ) -> (PumpReport, PumpReport)
    where
        CR: Stream<Item = Result<Frame, RelayError>> + Unpin,
        CT: Sink<Frame, Error = RelayError> + Unpin,
        UR: Stream<Item = Result<Frame, RelayError>> + Unpin,
        UT: Sink<Frame, Error = RelayError> + Unpin,
    {
        let cancel = CancellationToken::new();
        let preview_chars = self.config.preview_chars;
        let drain_timeout = self.config.drain_timeout;

        let to_upstream = pump(
            client_rx,
            upstream_tx,
            Direction::ClientToUpstream,
            preview_chars,
            &cancel,
        );
        let to_client = pump(
            upstream_rx,
            client_tx,
            Direction::UpstreamToClient,
            preview_chars,
            &cancel,
        );
        tokio::pin!(to_upstream, to_client);

        let first = tokio::select! {
            report = &mut to_upstream => report,
            report = &mut to_client => report,
        };

        self.transition(SessionState::Draining);
        cancel.cancel();

        let remaining = first.direction.reverse();
        let drain = async {
            match remaining {
                Direction::ClientToUpstream => (&mut to_upstream).await,
                Direction::UpstreamToClient => (&mut to_client).await,
            }
        };
        let second = match tokio::time::timeout(drain_timeout, drain).await {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!(direction = %remaining, ?drain_timeout, "pump did not stop in time, abandoning");
                PumpReport::abandoned(remaining)
            }
        };

        (first, second)
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = %self.state, to = %next, "session state");
        self.state = next;
    }
}

/// Chooses the close frames for `(client, upstream)` from the winning
/// pump's outcome.
///
/// A clean close is mirrored to the opposite peer when its code may be
/// sent on the wire. A pump error closes both peers abnormally.
fn teardown_reasons(first: &PumpReport) -> (CloseReason, CloseReason) {
    let mirrored = match &first.outcome {
        PumpOutcome::Closed(Some(reason)) => reason.clone().into_sendable(),
        PumpOutcome::Closed(None) | PumpOutcome::Cancelled | PumpOutcome::Abandoned => {
            CloseReason::normal()
        }
        PumpOutcome::Errored(err) => {
            let reason = CloseReason::new(err.close_code(), err.to_string());
            return (reason.clone(), reason);
        }
    };
    match first.direction {
        Direction::ClientToUpstream => (CloseReason::normal(), mirrored),
        Direction::UpstreamToClient => (mirrored, CloseReason::normal()),
    }
}

/// Sends a close frame, flushes, then reads until the peer finishes the
/// closing handshake.
///
/// The whole sequence is bounded by `timeout`: a peer that stops reading
/// cannot hold the session open. On expiry the endpoint is left for the
/// caller to drop, which closes the socket. Failures mean the endpoint is
/// already closed and are only logged.
async fn close_endpoint<T, R>(
    tx: &mut T,
    rx: &mut R,
    reason: CloseReason,
    timeout: Duration,
    peer: &'static str,
) where
    T: Sink<Frame, Error = RelayError> + Unpin,
    R: Stream<Item = Result<Frame, RelayError>> + Unpin,
{
    let code = reason.code();
    let closing = async {
        if let Err(err) = tx.send(Frame::Close(Some(reason))).await {
            tracing::debug!(peer, error = %err, "close frame not sent, endpoint already closed");
        }
        if let Err(err) = tx.close().await {
            tracing::debug!(peer, error = %err, "sink already closed");
        }
        while let Some(Ok(_)) = rx.next().await {}
    };
    if tokio::time::timeout(timeout, closing).await.is_err() {
        tracing::debug!(peer, ?timeout, "closing handshake timed out, dropping endpoint");
    }
    tracing::info!(peer, code, "endpoint closed");
}

fn forwarded(first: &PumpReport, second: &PumpReport, direction: Direction) -> u64 {
    if first.direction == direction {
        first.forwarded
    } else {
        second.forwarded
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unexpected failure".to_string())
}

fn client_stream(
    rx: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<Frame, RelayError>> + Unpin {
    rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => Frame::from_client(msg).map(Ok),
            Err(err) => Some(Err(RelayError::from_client(
                Direction::ClientToUpstream,
                err,
            ))),
        })
    })
}

fn client_sink(
    tx: SplitSink<WebSocket, ClientMessage>,
) -> impl Sink<Frame, Error = RelayError> + Unpin {
    tx.sink_map_err(|err| RelayError::from_client(Direction::UpstreamToClient, err))
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(frame.into_client())))
}

fn upstream_stream(
    rx: SplitStream<UpstreamSocket>,
) -> impl Stream<Item = Result<Frame, RelayError>> + Unpin {
    rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => Frame::from_upstream(msg).map(Ok),
            Err(err) => Some(Err(RelayError::from_upstream(
                Direction::UpstreamToClient,
                err,
            ))),
        })
    })
}

fn upstream_sink(
    tx: SplitSink<UpstreamSocket, UpstreamMessage>,
) -> impl Sink<Frame, Error = RelayError> + Unpin {
    tx.sink_map_err(|err| RelayError::from_upstream(Direction::ClientToUpstream, err))
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(frame.into_upstream())))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_util::stream;

    use super::*;
    use crate::config::{UpstreamConfig, UpstreamCredentials};

    type RecordingSink = futures_util::sink::SinkMapErr<Vec<Frame>, fn(Infallible) -> RelayError>;

    fn never(e: Infallible) -> RelayError {
        match e {}
    }

    fn recording_sink() -> RecordingSink {
        Vec::new().sink_map_err(never as fn(Infallible) -> RelayError)
    }

    fn idle() -> stream::Pending<Result<Frame, RelayError>> {
        stream::pending()
    }

    /// Endpoint whose peer never reads: nothing ever becomes ready.
    struct StalledSink;

    impl Sink<Frame> for StalledSink {
        type Error = RelayError;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Frame) -> Result<(), RelayError> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), RelayError>> {
            Poll::Pending
        }
    }

    fn session(drain_timeout: Duration) -> RelaySession {
        let creds = UpstreamCredentials {
            auth_token: "t".to_string(),
            protocol_version: "1".to_string(),
            device_id: "d".to_string(),
            client_id: "c".to_string(),
        };
        let Ok(upstream) = UpstreamConfig::new("ws://127.0.0.1:1/", creds) else {
            panic!("valid upstream config");
        };
        let Ok(addr) = "127.0.0.1:0".parse() else {
            panic!("valid address");
        };
        let mut config = RelayConfig::new(addr, upstream);
        config.drain_timeout = drain_timeout;
        RelaySession::new(addr, Arc::new(config))
    }

    fn report(direction: Direction, outcome: PumpOutcome) -> PumpReport {
        PumpReport {
            direction,
            outcome,
            forwarded: 0,
        }
    }

    #[test]
    fn upstream_close_is_mirrored_to_client() {
        let first = report(
            Direction::UpstreamToClient,
            PumpOutcome::Closed(Some(CloseReason::new(4001, "session expired"))),
        );
        let (client, upstream) = teardown_reasons(&first);
        assert_eq!(client.code(), 4001);
        assert_eq!(client.reason(), "session expired");
        assert_eq!(upstream.code(), 1000);
    }

    #[test]
    fn client_close_is_mirrored_to_upstream() {
        let first = report(
            Direction::ClientToUpstream,
            PumpOutcome::Closed(Some(CloseReason::new(1001, "going away"))),
        );
        let (client, upstream) = teardown_reasons(&first);
        assert_eq!(client.code(), 1000);
        assert_eq!(upstream.code(), 1001);
    }

    #[test]
    fn reserved_close_code_becomes_normal() {
        let first = report(
            Direction::UpstreamToClient,
            PumpOutcome::Closed(Some(CloseReason::new(1005, ""))),
        );
        let (client, _) = teardown_reasons(&first);
        assert_eq!(client.code(), 1000);
    }

    #[test]
    fn pump_error_closes_both_abnormally() {
        let first = report(
            Direction::UpstreamToClient,
            PumpOutcome::Errored(RelayError::Transport {
                direction: Direction::UpstreamToClient,
                reason: "connection reset".to_string(),
            }),
        );
        let (client, upstream) = teardown_reasons(&first);
        assert_eq!(client.code(), 1011);
        assert_eq!(upstream.code(), 1011);
        assert!(client.reason().contains("connection reset"));
    }

    #[test]
    fn forwarded_counts_are_picked_by_direction() {
        let mut first = report(Direction::ClientToUpstream, PumpOutcome::Closed(None));
        first.forwarded = 3;
        let mut second = report(Direction::UpstreamToClient, PumpOutcome::Cancelled);
        second.forwarded = 7;
        assert_eq!(forwarded(&first, &second, Direction::ClientToUpstream), 3);
        assert_eq!(forwarded(&first, &second, Direction::UpstreamToClient), 7);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unexpected failure");
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::Draining.to_string(), "draining");
    }

    #[test]
    fn new_session_starts_connecting() {
        let session = session(Duration::from_secs(2));
        assert_eq!(session.state, SessionState::Connecting);
        assert_eq!(session.id().to_string().len(), 36);
    }

    #[tokio::test]
    async fn first_finished_pump_cancels_its_sibling() {
        let mut session = session(Duration::from_millis(500));
        let mut client_rx = stream::iter(vec![
            Ok(Frame::text("hello")),
            Ok(Frame::Close(Some(CloseReason::new(1001, "going away")))),
        ]);
        let mut client_tx = recording_sink();
        let mut upstream_rx = idle();
        let mut upstream_tx = recording_sink();

        let (first, second) = session
            .relay(
                &mut client_rx,
                &mut client_tx,
                &mut upstream_rx,
                &mut upstream_tx,
            )
            .await;

        assert_eq!(first.direction, Direction::ClientToUpstream);
        let PumpOutcome::Closed(Some(reason)) = &first.outcome else {
            panic!("expected client close, got {:?}", first.outcome);
        };
        assert_eq!(reason.code(), 1001);
        assert_eq!(second.direction, Direction::UpstreamToClient);
        assert!(matches!(second.outcome, PumpOutcome::Cancelled));
        assert_eq!(session.state, SessionState::Draining);
        assert_eq!(upstream_tx.into_inner(), vec![Frame::text("hello")]);
        assert!(client_tx.into_inner().is_empty());
    }

    #[tokio::test]
    async fn pump_stuck_in_send_is_abandoned_after_drain_timeout() {
        let mut session = session(Duration::from_millis(200));
        let mut client_rx = Box::pin(stream::once(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, RelayError>(Frame::Close(None))
        }));
        let mut client_tx = StalledSink;
        let mut upstream_rx = stream::iter(vec![Ok(Frame::text("never delivered"))]).chain(idle());
        let mut upstream_tx = recording_sink();

        let started = tokio::time::Instant::now();
        let relayed = tokio::time::timeout(
            Duration::from_secs(3),
            session.relay(
                &mut client_rx,
                &mut client_tx,
                &mut upstream_rx,
                &mut upstream_tx,
            ),
        )
        .await;

        let Ok((first, second)) = relayed else {
            panic!("relay kept waiting on a pump blocked in send");
        };
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(first.direction, Direction::ClientToUpstream);
        assert!(matches!(first.outcome, PumpOutcome::Closed(None)));
        assert_eq!(second.direction, Direction::UpstreamToClient);
        assert!(matches!(second.outcome, PumpOutcome::Abandoned));
    }

    #[tokio::test]
    async fn panicking_pump_closes_client_with_proxy_error() {
        let mut session = session(Duration::from_millis(100));
        let mut panicked = false;
        let mut client_rx = stream::poll_fn(move |_| -> Poll<Option<Result<Frame, RelayError>>> {
            if !panicked {
                panicked = true;
                panic!("boom");
            }
            Poll::Ready(None)
        });
        let mut client_tx = recording_sink();
        let mut upstream_rx = idle();
        let mut upstream_tx = recording_sink();

        session
            .bridge(
                &mut client_rx,
                &mut client_tx,
                &mut upstream_rx,
                &mut upstream_tx,
            )
            .await;

        assert_eq!(session.state, SessionState::Closed);
        let to_client = client_tx.into_inner();
        let Some(Frame::Close(Some(reason))) = to_client.last() else {
            panic!("client got no close frame: {to_client:?}");
        };
        assert_eq!(reason.code(), 1011);
        assert!(reason.reason().starts_with("proxy error: "), "{}", reason.reason());
        assert!(reason.reason().contains("boom"));

        let to_upstream = upstream_tx.into_inner();
        let Some(Frame::Close(Some(reason))) = to_upstream.last() else {
            panic!("upstream got no close frame: {to_upstream:?}");
        };
        assert_eq!(reason.code(), 1000);
    }

    #[tokio::test]
    async fn closing_gives_up_on_a_peer_that_stops_reading() {
        let mut tx = StalledSink;
        let mut rx = idle();

        let closed = tokio::time::timeout(
            Duration::from_secs(3),
            close_endpoint(
                &mut tx,
                &mut rx,
                CloseReason::normal(),
                Duration::from_millis(200),
                "client",
            ),
        )
        .await;

        assert!(closed.is_ok(), "close was not bounded by its timeout");
    }

    #[tokio::test]
    async fn closing_sends_the_close_frame_once() {
        let mut tx = recording_sink();
        let mut rx = stream::iter(vec![Ok(Frame::text("late")), Ok(Frame::Close(None))]);

        close_endpoint(
            &mut tx,
            &mut rx,
            CloseReason::new(4000, "bye"),
            Duration::from_millis(200),
            "upstream",
        )
        .await;

        assert_eq!(
            tx.into_inner(),
            vec![Frame::Close(Some(CloseReason::new(4000, "bye")))]
        );
    }
}
