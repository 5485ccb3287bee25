use crate::error::ConfigError;
use crate::peer::types::{ConnectionId, IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

/// Public STUN servers used when nothing else is configured.
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Rejects server lists a peer connection could not use.
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<(), ConfigError> {
    for server in servers {
        if server.url.trim().is_empty() {
            return Err(ConfigError::EmptyIceUrl(server.id.clone()));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(ConfigError::TurnCredentialsMissing(server.id.clone()));
        }
    }
    Ok(())
}

pub fn rtc_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Remote candidates that arrived before their connection had a remote
/// description (or before the connection existed at all).
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: HashMap<ConnectionId, Vec<IceCandidate>>,
}

impl CandidateQueue {
    pub fn push(&mut self, connection_id: &ConnectionId, candidate: IceCandidate) {
        debug!("Queuing remote candidate for {}", connection_id);
        self.pending
            .entry(connection_id.clone())
            .or_default()
            .push(candidate);
    }

    pub fn take(&mut self, connection_id: &ConnectionId) -> Vec<IceCandidate> {
        self.pending.remove(connection_id).unwrap_or_default()
    }

    pub fn discard(&mut self, connection_id: &ConnectionId) {
        self.pending.remove(connection_id);
    }

    pub fn len(&self, connection_id: &ConnectionId) -> usize {
        self.pending.get(connection_id).map_or(0, Vec::len)
    }
}

/// Applies queued candidates once the remote description is in place.
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        debug!("Applying pending candidate: {}", candidate.candidate);
        if let Err(e) = pc.add_ice_candidate(to_rtc_candidate(candidate)).await {
            warn!("Failed to apply pending candidate: {:?}", e);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateCounts {
    let mut counts = CandidateCounts::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            counts.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            counts.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            counts.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        counts.host, counts.srflx, counts.relay
    );
    if counts.srflx == 0 && counts.relay == 0 {
        warn!("No server-reflexive or relay candidates; calls across NAT may fail");
    }
    counts
}

/// Checks that an ICE server answers by gathering candidates against it
/// alone: STUN must yield a srflx candidate, TURN a relay candidate.
pub async fn check_ice_server_availability(config: &ServerConfig, wait: Duration) -> bool {
    let ice_servers = rtc_ice_servers(std::slice::from_ref(config));
    info!("Checking ICE server {:?}", ice_servers.first().map(|s| &s.urls));

    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let api = APIBuilder::new().build();
    let pc = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => pc,
        Err(e) => {
            warn!("Failed to create check peer connection: {:?}", e);
            return false;
        }
    };

    let wanted = if config.r#type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    };
    let available = gather_for(&pc, wanted, wait).await;
    // Every outcome of the gather ends here
    if let Err(e) = pc.close().await {
        debug!("Closing check peer connection: {:?}", e);
    }
    info!("ICE server {} available: {}", config.url, available);
    available
}

/// Starts gathering on `pc` and waits for a candidate line containing
/// `wanted`. Leaves closing `pc` to the caller.
async fn gather_for(pc: &RTCPeerConnection, wanted: &'static str, wait: Duration) -> bool {
    let (found_tx, mut found_rx) = mpsc::channel::<bool>(4);
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

    pc.on_ice_candidate(Box::new(move |candidate| {
        let found_tx = found_tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(init) = c.to_json() {
                    if init.candidate.contains(wanted) {
                        let _ = found_tx.send(true).await;
                    }
                }
            }
        })
    }));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        let done_tx = done_tx.clone();
        Box::pin(async move {
            if state == RTCIceGathererState::Complete {
                let _ = done_tx.send(()).await;
            }
        })
    }));

    // A data channel gives the offer something to gather for
    if let Err(e) = pc.create_data_channel("ice-check", None).await {
        warn!("Failed to create check data channel: {:?}", e);
        return false;
    }
    let started = match pc.create_offer(None).await {
        Ok(offer) => pc.set_local_description(offer).await.is_ok(),
        Err(_) => false,
    };
    if !started {
        return false;
    }

    tokio::select! {
        result = timeout(wait, found_rx.recv()) => matches!(result, Ok(Some(true))),
        _ = done_rx.recv() => found_rx.try_recv().unwrap_or(false),
    }
}
