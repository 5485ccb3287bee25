//! Call session state machine.

use crate::error::CallError;
use crate::media::{LocalStream, RemoteStream, StreamInfo};
use crate::peer::types::{ConnectionId, SessionDescription, SignalingIdentity};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallState {
    Idle,
    AcquiringLocalMedia,
    /// Inbound: local stream bound and answer sent, waiting for remote media.
    Answering,
    /// Outbound: offer placed, waiting for remote media.
    Calling,
    Connected,
    Failed { reason: String },
    Closed,
}

impl CallState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }

    /// States in which mute/camera toggles apply.
    pub fn accepts_toggles(&self) -> bool {
        matches!(self, Self::Calling | Self::Connected)
    }
}

#[derive(Debug, Clone)]
pub enum CallTransition {
    BeginCapture,
    CaptureFailed { reason: String },
    Answered,
    OfferPlaced,
    RemoteStreamBound,
    NegotiationFailed { reason: String },
    Close,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// One active or pending peer connection.
#[derive(Debug)]
pub struct CallSession {
    connection_id: ConnectionId,
    remote: SignalingIdentity,
    direction: CallDirection,
    state: CallState,
    local: Option<LocalStream>,
    remote_stream: Option<RemoteStream>,
    remote_offer: Option<SessionDescription>,
    muted: bool,
    camera_enabled: bool,
    created_at: DateTime<Utc>,
    state_since: DateTime<Utc>,
}

impl CallSession {
    pub fn new_outbound(connection_id: ConnectionId, remote: SignalingIdentity) -> Self {
        Self::new(connection_id, remote, CallDirection::Outbound, None)
    }

    pub fn new_inbound(
        connection_id: ConnectionId,
        remote: SignalingIdentity,
        offer: SessionDescription,
    ) -> Self {
        Self::new(connection_id, remote, CallDirection::Inbound, Some(offer))
    }

    fn new(
        connection_id: ConnectionId,
        remote: SignalingIdentity,
        direction: CallDirection,
        remote_offer: Option<SessionDescription>,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            remote,
            direction,
            state: CallState::Idle,
            local: None,
            remote_stream: None,
            remote_offer,
            muted: false,
            camera_enabled: true,
            created_at: now,
            state_since: now,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn remote(&self) -> &SignalingIdentity {
        &self.remote
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.camera_enabled
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn remote_offer(&self) -> Option<&SessionDescription> {
        self.remote_offer.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state_since(&self) -> DateTime<Utc> {
        self.state_since
    }

    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        use CallDirection::*;
        use CallState::*;

        let next = match (&self.state, self.direction, transition) {
            (Idle, _, CallTransition::BeginCapture) => AcquiringLocalMedia,
            (AcquiringLocalMedia, _, CallTransition::CaptureFailed { reason }) => Failed { reason },
            (AcquiringLocalMedia, Inbound, CallTransition::Answered) if self.local.is_some() => {
                Answering
            }
            (AcquiringLocalMedia, Outbound, CallTransition::OfferPlaced) if self.local.is_some() => {
                Calling
            }
            (
                Answering | Calling | Connected,
                _,
                CallTransition::RemoteStreamBound,
            ) if self.remote_stream.is_some() => Connected,
            (
                AcquiringLocalMedia | Answering | Calling,
                _,
                CallTransition::NegotiationFailed { reason },
            ) => Failed { reason },
            (_, _, CallTransition::Close) => Closed,
            (current, _, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };

        if next != self.state {
            debug!(
                "Session {}: {:?} -> {:?}",
                self.connection_id, self.state, next
            );
            self.state = next;
            self.state_since = Utc::now();
        }
        if self.state.is_terminal() {
            self.release_local();
        }
        Ok(())
    }

    /// Takes ownership of the captured stream. A session holds at most one;
    /// a second stream is stopped and rejected.
    pub fn attach_local(&mut self, stream: LocalStream) -> Result<&LocalStream, CallError> {
        if self.state.is_terminal() {
            stream.stop();
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: format!("{:?}", self.state),
                attempted: "AttachLocal".to_string(),
            }));
        }
        if self.local.is_some() {
            stream.stop();
            return Err(CallError::StreamAlreadyAttached(
                self.connection_id.to_string(),
            ));
        }
        self.muted = !stream.audio_tracks().any(|t| t.is_enabled());
        self.camera_enabled = stream.video_tracks().any(|t| t.is_enabled());
        Ok(self.local.insert(stream))
    }

    /// Outbound policy: the caller does not broadcast until it chooses to.
    pub fn start_muted(&mut self) {
        if let Some(stream) = &self.local {
            stream.set_audio_enabled(false);
            stream.set_video_enabled(false);
            self.muted = true;
            self.camera_enabled = false;
        }
    }

    pub fn bind_remote(&mut self, stream: RemoteStream) -> Result<(), InvalidTransition> {
        if !matches!(
            self.state,
            CallState::Answering | CallState::Calling | CallState::Connected
        ) {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.state),
                attempted: "RemoteStreamBound".to_string(),
            });
        }
        self.remote_stream = Some(stream);
        self.apply_transition(CallTransition::RemoteStreamBound)
    }

    /// Flips the audio tracks. Returns the new muted flag, or `None` when
    /// there is no live local stream or the call is not up yet.
    pub fn toggle_mute(&mut self) -> Option<bool> {
        if !self.state.accepts_toggles() {
            return None;
        }
        let stream = self.local.as_ref().filter(|s| s.is_live())?;
        let muted = !self.muted;
        stream.set_audio_enabled(!muted);
        self.muted = muted;
        Some(muted)
    }

    /// Flips the video tracks. Returns the new camera-enabled flag.
    pub fn toggle_camera(&mut self) -> Option<bool> {
        if !self.state.accepts_toggles() {
            return None;
        }
        let stream = self.local.as_ref().filter(|s| s.is_live())?;
        let enabled = !self.camera_enabled;
        stream.set_video_enabled(enabled);
        self.camera_enabled = enabled;
        Some(enabled)
    }

    /// Ends the session and stops local tracks. Idempotent.
    pub fn close(&mut self) {
        // Close is accepted from every state
        let _ = self.apply_transition(CallTransition::Close);
    }

    fn release_local(&mut self) {
        if let Some(stream) = self.local.take() {
            stream.stop();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            remote: self.remote.clone(),
            direction: self.direction,
            state: self.state.clone(),
            muted: self.muted,
            camera_enabled: self.camera_enabled,
            local: self.local.as_ref().map(LocalStream::info),
            remote_stream: self.remote_stream.as_ref().map(RemoteStream::info),
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a session for UIs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection_id: ConnectionId,
    pub remote: SignalingIdentity,
    pub direction: CallDirection,
    pub state: CallState,
    pub muted: bool,
    pub camera_enabled: bool,
    pub local: Option<StreamInfo>,
    pub remote_stream: Option<StreamInfo>,
    pub created_at: DateTime<Utc>,
}
