use crate::error::{MediaAccessError, NegotiationError};
use crate::media::{LocalStream, RemoteStream};
use crate::peer::types::{ConnectionId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Peer link health as seen by the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Dropped; the grace period is running.
    Interrupted,
    Failed,
    Closed,
}

/// Completions and callbacks delivered back to the dispatch loop.
#[derive(Debug)]
pub enum MediaEvent {
    Captured {
        connection_id: ConnectionId,
        result: Result<LocalStream, MediaAccessError>,
    },
    LocalCandidate {
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    RemoteStream {
        connection_id: ConnectionId,
        stream: RemoteStream,
    },
    LinkState {
        connection_id: ConnectionId,
        state: LinkState,
    },
}

pub type MediaEvents = mpsc::UnboundedSender<MediaEvent>;

/// Turns a local stream plus remote SDP into a live peer connection.
/// Connections are keyed by connection id; remote media, local candidates
/// and link changes are reported on the `events` channel given at setup.
#[async_trait]
pub trait MediaNegotiator: Send + Sync {
    async fn create_offer(
        &self,
        connection_id: &ConnectionId,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn accept_offer(
        &self,
        connection_id: &ConnectionId,
        offer: &SessionDescription,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn apply_answer(
        &self,
        connection_id: &ConnectionId,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Candidates that arrive before the remote description is set (or
    /// before the connection exists) are held and applied later.
    async fn add_remote_candidate(
        &self,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError>;

    /// Tears down the connection and drops held candidates. Idempotent.
    async fn close(&self, connection_id: &ConnectionId);
}
