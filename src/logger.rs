use crate::config::{DEFAULT_LOG_FILTER, LOG_ENV};
use crate::peer::state::CallState;
use crate::peer::types::{ConnectionId, SignalingIdentity};
use log::{debug, info};
use serde::Serialize;
use std::io::Write;
use tokio::sync::broadcast;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Installs the global logger with timestamped lines. Safe to call twice.
pub fn init() {
    let env = env_logger::Env::new().filter_or(LOG_ENV, DEFAULT_LOG_FILTER);
    let _ = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            let now = chrono::Local::now();
            writeln!(
                buf,
                "RUST: [{}] {:<5} {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Logs an ICE candidate as it is gathered (trickle ICE).
pub async fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
            init.candidate, init.sdp_mid, init.sdp_mline_index, init.username_fragment
        );
    }
}

/// Quick getStats snapshot of the nominated pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

// ========== UI EVENTS ==========

/// Events for whatever front end is attached (console, UI shell).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AppEvent {
    IdentityAssigned { id: SignalingIdentity },
    RelayUnavailable { reason: String },
    RelayLost,
    IncomingCall { connection_id: ConnectionId, from: SignalingIdentity },
    CallState { connection_id: ConnectionId, state: CallState },
    MuteChanged { connection_id: ConnectionId, muted: bool },
    CameraChanged { connection_id: ConnectionId, enabled: bool },
    ConnectionProblem { connection_id: ConnectionId },
    ConnectionRecovering { connection_id: ConnectionId },
    ConnectionRecovered { connection_id: ConnectionId },
    ConnectionFailed { connection_id: ConnectionId },
}

/// Fan-out of [`AppEvent`]s. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: AppEvent) {
        debug!("emit {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn emit_identity(&self, id: &SignalingIdentity) {
        self.emit(AppEvent::IdentityAssigned { id: id.clone() });
    }

    pub fn emit_relay_unavailable(&self, reason: impl Into<String>) {
        self.emit(AppEvent::RelayUnavailable {
            reason: reason.into(),
        });
    }

    pub fn emit_relay_lost(&self) {
        self.emit(AppEvent::RelayLost);
    }

    pub fn emit_incoming_call(&self, connection_id: &ConnectionId, from: &SignalingIdentity) {
        self.emit(AppEvent::IncomingCall {
            connection_id: connection_id.clone(),
            from: from.clone(),
        });
    }

    pub fn emit_state(&self, connection_id: &ConnectionId, state: &CallState) {
        self.emit(AppEvent::CallState {
            connection_id: connection_id.clone(),
            state: state.clone(),
        });
    }

    pub fn emit_mute(&self, connection_id: &ConnectionId, muted: bool) {
        self.emit(AppEvent::MuteChanged {
            connection_id: connection_id.clone(),
            muted,
        });
    }

    pub fn emit_camera(&self, connection_id: &ConnectionId, enabled: bool) {
        self.emit(AppEvent::CameraChanged {
            connection_id: connection_id.clone(),
            enabled,
        });
    }

    pub fn emit_connection_problem(&self, connection_id: &ConnectionId) {
        info!("Connection problem on {}", connection_id);
        self.emit(AppEvent::ConnectionProblem {
            connection_id: connection_id.clone(),
        });
    }

    pub fn emit_connection_recovering(&self, connection_id: &ConnectionId) {
        self.emit(AppEvent::ConnectionRecovering {
            connection_id: connection_id.clone(),
        });
    }

    pub fn emit_connection_recovered(&self, connection_id: &ConnectionId) {
        info!("Connection {} recovered", connection_id);
        self.emit(AppEvent::ConnectionRecovered {
            connection_id: connection_id.clone(),
        });
    }

    pub fn emit_connection_failed(&self, connection_id: &ConnectionId) {
        info!("Connection {} recovery failed", connection_id);
        self.emit(AppEvent::ConnectionFailed {
            connection_id: connection_id.clone(),
        });
    }
}
