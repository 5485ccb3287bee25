//! Call session manager.
//!
//! Owns every [`CallSession`] and runs them from a single dispatch loop:
//! relay events, media events (capture completions, negotiator
//! callbacks), a periodic tick and user commands all arrive on channels
//! and are handled one at a time, so no session state is shared across
//! tasks.

use crate::config::{ClientConfig, Role};
use crate::logger::Emitter;
use crate::media::{LocalStream, MediaCapture, MediaConstraints, PlaybackSink, StreamSource};
use crate::peer::negotiator::{LinkState, MediaEvent, MediaEvents, MediaNegotiator};
use crate::peer::state::{CallDirection, CallSession, CallState, CallTransition, SessionSnapshot};
use crate::peer::types::{ConnectionId, IceCandidate, SessionDescription, SignalingIdentity};
use crate::relay::{IdentityClient, RelayEvent};
use crate::signaling::{RelayMessage, SdpPayload};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// How long a failed session stays visible in status before it is pruned.
const FAILED_RETENTION: Duration = Duration::from_secs(30);

/// Returned to the caller once an outbound call has been placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallHandle {
    pub connection_id: ConnectionId,
    pub remote: SignalingIdentity,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub identity: Option<SignalingIdentity>,
    pub relay_open: bool,
    pub role: Role,
    pub focused: Option<ConnectionId>,
    pub sessions: Vec<SessionSnapshot>,
}

impl ManagerSnapshot {
    pub fn session(&self, connection_id: &ConnectionId) -> Option<&SessionSnapshot> {
        self.sessions
            .iter()
            .find(|s| &s.connection_id == connection_id)
    }

    pub fn focused_session(&self) -> Option<&SessionSnapshot> {
        self.focused.as_ref().and_then(|id| self.session(id))
    }
}

#[derive(Debug)]
pub enum Command {
    Call {
        peer: SignalingIdentity,
        reply: oneshot::Sender<Option<CallHandle>>,
    },
    ToggleMute(oneshot::Sender<Option<bool>>),
    ToggleCamera(oneshot::Sender<Option<bool>>),
    HangUp(oneshot::Sender<bool>),
    Status(oneshot::Sender<ManagerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Where bound streams are shown: the local preview and remote playback.
#[derive(Clone)]
pub struct Sinks {
    pub local: Arc<dyn PlaybackSink>,
    pub remote: Arc<dyn PlaybackSink>,
}

pub struct CallSessionManager {
    identity: IdentityClient,
    capture: Arc<dyn MediaCapture>,
    negotiator: Arc<dyn MediaNegotiator>,
    sinks: Sinks,
    emitter: Emitter,
    role: Role,
    call_timeout: Option<Duration>,

    sessions: HashMap<ConnectionId, CallSession>,
    focus: Option<ConnectionId>,
    pending_calls: HashMap<ConnectionId, oneshot::Sender<Option<CallHandle>>>,
    interrupted: HashSet<ConnectionId>,
    local_bound: Option<ConnectionId>,
    remote_bound: Option<ConnectionId>,

    media_tx: MediaEvents,
    media_rx: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    shut_down: bool,
}

impl CallSessionManager {
    pub fn new(
        identity: IdentityClient,
        capture: Arc<dyn MediaCapture>,
        negotiator: Arc<dyn MediaNegotiator>,
        sinks: Sinks,
        emitter: Emitter,
        config: &ClientConfig,
    ) -> Self {
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        Self {
            identity,
            capture,
            negotiator,
            sinks,
            emitter,
            role: config.role,
            call_timeout: config.call_timeout,
            sessions: HashMap::new(),
            focus: None,
            pending_calls: HashMap::new(),
            interrupted: HashSet::new(),
            local_bound: None,
            remote_bound: None,
            media_tx,
            media_rx: Some(media_rx),
            shut_down: false,
        }
    }

    /// Dispatch loop. Returns after `Shutdown` or when every command
    /// sender is gone; either way all sessions and the relay connection
    /// are closed first.
    pub async fn run(
        mut self,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let Some(mut media_rx) = self.media_rx.take() else {
            error!("Call session manager already ran");
            return;
        };
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut relay_live = true;

        info!("Call session manager started ({:?} role)", self.role);
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = relay_events.recv(), if relay_live => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => {
                        debug!("Relay event stream ended");
                        relay_live = false;
                    }
                },
                Some(event) = media_rx.recv() => self.handle_media_event(event).await,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("Call session manager stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call { peer, reply } => self.request_call(peer, reply),
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleCamera(reply) => {
                let _ = reply.send(self.toggle_camera());
            }
            Command::HangUp(reply) => {
                let done = self.hang_up().await;
                let _ = reply.send(done);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    // ========== OPERATIONS ==========

    /// Starts an outbound call. The handle (or `None`) is sent on `reply`
    /// once the call has been placed or has failed.
    pub fn request_call(
        &mut self,
        peer: SignalingIdentity,
        reply: oneshot::Sender<Option<CallHandle>>,
    ) {
        if self.shut_down || peer.is_empty() {
            let _ = reply.send(None);
            return;
        }

        let connection_id = ConnectionId::generate();
        let mut session = CallSession::new_outbound(connection_id.clone(), peer.clone());
        if let Err(e) = session.apply_transition(CallTransition::BeginCapture) {
            warn!("Cannot start call to {}: {}", peer, e);
            let _ = reply.send(None);
            return;
        }
        info!("Calling {} ({})", peer, connection_id);
        self.emitter.emit_state(&connection_id, session.state());
        self.sessions.insert(connection_id.clone(), session);
        self.pending_calls.insert(connection_id.clone(), reply);
        self.focus = Some(connection_id.clone());
        self.start_capture(connection_id);
    }

    /// Flips mute on the focused session. `None` when there is nothing to
    /// toggle.
    pub fn toggle_mute(&mut self) -> Option<bool> {
        let id = self.focus.clone()?;
        let muted = self.sessions.get_mut(&id)?.toggle_mute()?;
        info!("Session {} muted={}", id, muted);
        self.emitter.emit_mute(&id, muted);
        Some(muted)
    }

    pub fn toggle_camera(&mut self) -> Option<bool> {
        let id = self.focus.clone()?;
        let enabled = self.sessions.get_mut(&id)?.toggle_camera()?;
        info!("Session {} camera_enabled={}", id, enabled);
        self.emitter.emit_camera(&id, enabled);
        Some(enabled)
    }

    /// Ends the focused session and tells the remote.
    pub async fn hang_up(&mut self) -> bool {
        match self.focus.clone() {
            Some(id) => {
                self.close_session(&id, true).await;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let mut sessions: Vec<SessionSnapshot> =
            self.sessions.values().map(CallSession::snapshot).collect();
        sessions.sort_by_key(|s| s.created_at);
        ManagerSnapshot {
            identity: self.identity.identity(),
            relay_open: self.identity.is_open(),
            role: self.role,
            focused: self.focus.clone(),
            sessions,
        }
    }

    /// Closes every session (stopping its tracks) and the relay
    /// connection. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Tearing down {} call session(s)", self.sessions.len());
        let remotes: HashSet<SignalingIdentity> = self
            .sessions
            .values()
            .filter(|s| !s.state().is_terminal() && !s.remote().is_empty())
            .map(|s| s.remote().clone())
            .collect();

        let ids: Vec<ConnectionId> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.close_session(&id, false).await;
        }
        // One peer-wide LEAVE per remote: we are going away entirely
        for remote in remotes {
            if let Err(e) = self.identity.send(RelayMessage::leave(remote.clone())).await {
                debug!("LEAVE to {} not sent: {}", remote, e);
            }
        }
        for (_, reply) in self.pending_calls.drain() {
            let _ = reply.send(None);
        }
        self.identity.close().await;
    }

    // ========== RELAY EVENTS ==========

    pub async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Open(id) => {
                info!("Signaling identity ready: {}", id);
                self.emitter.emit_identity(&id);
            }
            RelayEvent::Unavailable(reason) => {
                warn!("Signaling relay unavailable: {}", reason);
                self.emitter.emit_relay_unavailable(reason);
            }
            RelayEvent::IncomingCall {
                connection_id,
                peer,
                offer,
            } => self.on_incoming_call(connection_id, peer, offer),
            RelayEvent::Answer {
                connection_id,
                answer,
                ..
            } => self.on_answer(connection_id, answer).await,
            RelayEvent::Candidate {
                connection_id,
                candidate,
                ..
            } => self.on_remote_candidate(connection_id, candidate).await,
            RelayEvent::PeerLeft {
                peer,
                connection_id,
            } => self.on_peer_left(peer, connection_id).await,
            RelayEvent::Expired(peer) => self.on_peer_left(peer, None).await,
            RelayEvent::Error(msg) => warn!("Relay error: {}", msg),
            RelayEvent::Disconnected => {
                warn!("Relay connection lost; identity invalidated");
                self.emitter.emit_relay_lost();
            }
        }
    }

    /// Closes the named call with `peer`, or every call with it when no
    /// call is named.
    async fn on_peer_left(&mut self, peer: SignalingIdentity, only: Option<ConnectionId>) {
        let ids: Vec<ConnectionId> = self
            .sessions
            .values()
            .filter(|s| s.remote() == &peer)
            .filter(|s| only.as_ref().map_or(true, |id| s.connection_id() == id))
            .map(|s| s.connection_id().clone())
            .collect();
        if !ids.is_empty() {
            info!("{} left; closing {} session(s)", peer, ids.len());
        }
        for id in ids {
            self.close_session(&id, false).await;
        }
    }

    fn on_incoming_call(
        &mut self,
        connection_id: ConnectionId,
        peer: SignalingIdentity,
        offer: SessionDescription,
    ) {
        if self.shut_down {
            return;
        }
        if !self.role.answers_inbound() {
            info!("Ignoring call from {} ({:?} role)", peer, self.role);
            return;
        }
        if self.sessions.contains_key(&connection_id) {
            debug!("Duplicate offer for {}", connection_id);
            return;
        }

        let mut session = CallSession::new_inbound(connection_id.clone(), peer.clone(), offer);
        if let Err(e) = session.apply_transition(CallTransition::BeginCapture) {
            warn!("Cannot answer {}: {}", peer, e);
            return;
        }
        info!("Incoming call from {} ({})", peer, connection_id);
        self.emitter.emit_incoming_call(&connection_id, &peer);
        self.emitter.emit_state(&connection_id, session.state());
        self.sessions.insert(connection_id.clone(), session);
        self.focus = Some(connection_id.clone());
        self.start_capture(connection_id);
    }

    async fn on_answer(&mut self, connection_id: ConnectionId, answer: SessionDescription) {
        let calling = self.sessions.get(&connection_id).is_some_and(|s| {
            s.direction() == CallDirection::Outbound && s.state() == &CallState::Calling
        });
        if !calling {
            debug!("Ignoring answer for {}", connection_id);
            return;
        }
        if let Err(e) = self.negotiator.apply_answer(&connection_id, &answer).await {
            error!("Failed to apply answer for {}: {}", connection_id, e);
            self.fail_session(&connection_id, e.to_string()).await;
        }
    }

    async fn on_remote_candidate(&mut self, connection_id: ConnectionId, candidate: IceCandidate) {
        let live = self
            .sessions
            .get(&connection_id)
            .is_some_and(|s| !s.state().is_terminal());
        if !live {
            debug!("Dropping candidate for unknown session {}", connection_id);
            return;
        }
        if let Err(e) = self
            .negotiator
            .add_remote_candidate(&connection_id, candidate)
            .await
        {
            warn!("Failed to add remote candidate for {}: {}", connection_id, e);
        }
    }

    // ========== MEDIA EVENTS ==========

    pub async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Captured {
                connection_id,
                result,
            } => self.on_captured(connection_id, result).await,
            MediaEvent::LocalCandidate {
                connection_id,
                candidate,
            } => {
                let Some(remote) = self
                    .sessions
                    .get(&connection_id)
                    .filter(|s| !s.state().is_terminal())
                    .map(|s| s.remote().clone())
                else {
                    return;
                };
                let msg = RelayMessage::candidate(remote, connection_id.clone(), candidate);
                if let Err(e) = self.identity.send(msg).await {
                    debug!("Local candidate for {} not sent: {}", connection_id, e);
                }
            }
            MediaEvent::RemoteStream {
                connection_id,
                stream,
            } => {
                let Some(session) = self.sessions.get_mut(&connection_id) else {
                    return;
                };
                let source = StreamSource::Remote(stream.clone());
                match session.bind_remote(stream) {
                    Ok(()) => {
                        self.sinks.remote.play(source);
                        self.remote_bound = Some(connection_id.clone());
                        self.emitter.emit_state(&connection_id, session.state());
                    }
                    Err(e) => warn!("Remote stream for {} not bound: {}", connection_id, e),
                }
            }
            MediaEvent::LinkState {
                connection_id,
                state,
            } => self.on_link_state(connection_id, state).await,
        }
    }

    fn start_capture(&self, connection_id: ConnectionId) {
        let capture = self.capture.clone();
        let events = self.media_tx.clone();
        tokio::spawn(async move {
            let result = capture.get_user_media(MediaConstraints::default()).await;
            let _ = events.send(MediaEvent::Captured {
                connection_id,
                result,
            });
        });
    }

    async fn on_captured(
        &mut self,
        connection_id: ConnectionId,
        result: Result<LocalStream, crate::error::MediaAccessError>,
    ) {
        let Some(session) = self.sessions.get_mut(&connection_id) else {
            // Session ended while the prompt was up; the stream drops here
            debug!("Capture finished for closed session {}", connection_id);
            return;
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("Local media unavailable for {}: {}", connection_id, e);
                let _ = session.apply_transition(CallTransition::CaptureFailed {
                    reason: e.to_string(),
                });
                self.emitter.emit_state(&connection_id, session.state());
                self.settle(&connection_id).await;
                return;
            }
        };
        if let Err(e) = session.attach_local(stream) {
            warn!("Captured stream rejected for {}: {}", connection_id, e);
            return;
        }

        match session.direction() {
            CallDirection::Outbound => self.place_call(connection_id).await,
            CallDirection::Inbound => self.answer_call(connection_id).await,
        }
    }

    /// Outbound: start muted, show the preview, send the offer.
    async fn place_call(&mut self, connection_id: ConnectionId) {
        let Some(session) = self.sessions.get_mut(&connection_id) else {
            return;
        };
        session.start_muted();
        self.emitter.emit_mute(&connection_id, session.is_muted());
        self.emitter.emit_camera(&connection_id, session.is_camera_enabled());
        let remote = session.remote().clone();
        if let Some(local) = session.local_stream() {
            self.sinks.local.play(StreamSource::Local(local.info()));
            self.local_bound = Some(connection_id.clone());
        }

        if !self.identity.is_open() {
            warn!("Signaling relay unavailable; call to {} not placed", remote);
            self.close_session(&connection_id, false).await;
            return;
        }

        let offer = match self
            .sessions
            .get(&connection_id)
            .and_then(|s| s.local_stream())
        {
            Some(local) => {
                self.negotiator
                    .create_offer(&connection_id, local, self.media_tx.clone())
                    .await
            }
            None => return,
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                error!("Failed to create offer for {}: {}", connection_id, e);
                self.fail_session(&connection_id, e.to_string()).await;
                return;
            }
        };

        let msg = RelayMessage::offer(remote.clone(), SdpPayload::media(connection_id.clone(), offer));
        if let Err(e) = self.identity.send(msg).await {
            warn!("Call to {} not placed: {}", remote, e);
            self.close_session(&connection_id, false).await;
            return;
        }

        if let Some(session) = self.sessions.get_mut(&connection_id) {
            if let Err(e) = session.apply_transition(CallTransition::OfferPlaced) {
                warn!("{}", e);
                return;
            }
            self.emitter.emit_state(&connection_id, session.state());
        }
        if let Some(reply) = self.pending_calls.remove(&connection_id) {
            let _ = reply.send(Some(CallHandle {
                connection_id,
                remote,
            }));
        }
    }

    /// Inbound: bind the local stream to the preview, then answer with it.
    async fn answer_call(&mut self, connection_id: ConnectionId) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let (Some(local), Some(offer)) = (session.local_stream(), session.remote_offer()) else {
            return;
        };
        let remote = session.remote().clone();
        self.sinks.local.play(StreamSource::Local(local.info()));
        self.local_bound = Some(connection_id.clone());

        let answer = self
            .negotiator
            .accept_offer(&connection_id, offer, local, self.media_tx.clone())
            .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(e) => {
                error!("Failed to answer {}: {}", remote, e);
                self.fail_session(&connection_id, e.to_string()).await;
                return;
            }
        };

        let msg = RelayMessage::answer(remote.clone(), SdpPayload::media(connection_id.clone(), answer));
        if let Err(e) = self.identity.send(msg).await {
            error!("Answer to {} not delivered: {}", remote, e);
            self.fail_session(&connection_id, e.to_string()).await;
            return;
        }

        if let Some(session) = self.sessions.get_mut(&connection_id) {
            match session.apply_transition(CallTransition::Answered) {
                Ok(()) => self.emitter.emit_state(&connection_id, session.state()),
                Err(e) => warn!("{}", e),
            }
        }
    }

    async fn on_link_state(&mut self, connection_id: ConnectionId, state: LinkState) {
        if !self.sessions.contains_key(&connection_id) {
            return;
        }
        match state {
            LinkState::Connected => {
                if self.interrupted.remove(&connection_id) {
                    self.emitter.emit_connection_recovered(&connection_id);
                }
            }
            LinkState::Interrupted => {
                self.interrupted.insert(connection_id.clone());
                self.emitter.emit_connection_problem(&connection_id);
                self.emitter.emit_connection_recovering(&connection_id);
            }
            LinkState::Failed => {
                self.interrupted.remove(&connection_id);
                self.emitter.emit_connection_failed(&connection_id);
                self.close_session(&connection_id, true).await;
            }
            LinkState::Closed => self.close_session(&connection_id, false).await,
        }
    }

    // ========== TEARDOWN ==========

    /// Marks the session failed; it stays listed until pruned.
    async fn fail_session(&mut self, connection_id: &ConnectionId, reason: String) {
        let Some(session) = self.sessions.get_mut(connection_id) else {
            return;
        };
        if session
            .apply_transition(CallTransition::NegotiationFailed { reason })
            .is_err()
        {
            session.close();
        }
        self.emitter.emit_state(connection_id, session.state());
        self.settle(connection_id).await;
    }

    /// Releases everything a session held outside the session itself.
    async fn settle(&mut self, connection_id: &ConnectionId) {
        self.negotiator.close(connection_id).await;
        self.interrupted.remove(connection_id);
        if self.local_bound.as_ref() == Some(connection_id) {
            self.sinks.local.stop();
            self.local_bound = None;
        }
        if self.remote_bound.as_ref() == Some(connection_id) {
            self.sinks.remote.stop();
            self.remote_bound = None;
        }
        if let Some(reply) = self.pending_calls.remove(connection_id) {
            let _ = reply.send(None);
        }
        if self.focus.as_ref() == Some(connection_id) {
            self.focus = self.next_focus();
        }
    }

    /// Closes and forgets a session. With `notify_remote`, the remote is
    /// sent a `LEAVE` naming this call only.
    async fn close_session(&mut self, connection_id: &ConnectionId, notify_remote: bool) {
        let Some(mut session) = self.sessions.remove(connection_id) else {
            return;
        };
        let was_terminal = session.state().is_terminal();
        session.close();
        self.emitter.emit_state(connection_id, session.state());

        if notify_remote && !was_terminal && !session.remote().is_empty() {
            if let Err(e) = self
                .identity
                .send(RelayMessage::leave_call(
                    session.remote().clone(),
                    connection_id.clone(),
                ))
                .await
            {
                debug!("LEAVE to {} not sent: {}", session.remote(), e);
            }
        }
        self.settle(connection_id).await;
        info!("Session {} with {} closed", connection_id, session.remote());
    }

    fn next_focus(&self) -> Option<ConnectionId> {
        self.sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .max_by_key(|s| s.created_at())
            .map(|s| s.connection_id().clone())
    }

    pub async fn tick(&mut self) {
        let now = Utc::now();
        let age = |since: chrono::DateTime<Utc>| (now - since).to_std().unwrap_or_default();

        if let Some(timeout) = self.call_timeout {
            let stalled: Vec<ConnectionId> = self
                .sessions
                .values()
                .filter(|s| s.state() == &CallState::Calling && age(s.state_since()) >= timeout)
                .map(|s| s.connection_id().clone())
                .collect();
            for id in stalled {
                warn!("No answer on {} after {:?}; closing", id, timeout);
                self.close_session(&id, true).await;
            }
        }

        self.sessions.retain(|id, s| {
            let keep = !matches!(s.state(), CallState::Failed { .. })
                || age(s.state_since()) < FAILED_RETENTION;
            if !keep {
                debug!("Pruning failed session {}", id);
            }
            keep
        });
    }
}

/// Starts the manager on its own task and hands back the command sender.
pub fn spawn_manager(
    manager: CallSessionManager,
    relay_events: mpsc::Receiver<RelayEvent>,
) -> (mpsc::Sender<Command>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(manager.run(relay_events, rx));
    (tx, handle)
}
