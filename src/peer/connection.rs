use crate::error::NegotiationError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{LocalStream, RemoteStream, RemoteTrack, TrackKind};
use crate::peer::ice::{
    analyze_candidates, apply_pending_candidates, from_rtc_candidate, rtc_ice_servers,
    to_rtc_candidate, CandidateQueue,
};
use crate::peer::negotiator::{LinkState, MediaEvent, MediaEvents, MediaNegotiator};
use crate::peer::types::{ConnectionId, IceCandidate, ServerConfig, SessionDescription};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Peer connections backed by the `webrtc` crate, one per call.
pub struct RtcNegotiator {
    api: API,
    ice_servers: Vec<ServerConfig>,
    grace_period: Duration,
    peers: Mutex<HashMap<ConnectionId, Arc<RTCPeerConnection>>>,
    pending: Mutex<CandidateQueue>,
}

impl RtcNegotiator {
    pub fn new(
        ice_servers: Vec<ServerConfig>,
        grace_period: Duration,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            ice_servers,
            grace_period,
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(CandidateQueue::default()),
        })
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.peers).len()
    }

    fn peer(&self, connection_id: &ConnectionId) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        lock(&self.peers)
            .get(connection_id)
            .cloned()
            .ok_or_else(|| NegotiationError::UnknownConnection(connection_id.to_string()))
    }

    /// Creates the peer connection for one call and wires its callbacks
    /// to `events`.
    async fn new_peer(
        &self,
        connection_id: &ConnectionId,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(&self.ice_servers)).await?);

        for track in local.tracks() {
            let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
            let sender = pc.add_track(rtp).await?;
            // RTCP has to be drained for the interceptors to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }

        let cid = connection_id.clone();
        let tx = events.clone();
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let cid = cid.clone();
            let tx = tx.clone();
            let gathered = gathered.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => {
                        dump_candidate("LOCAL", &c).await;
                        if let Ok(init) = c.to_json() {
                            let candidate = from_rtc_candidate(init);
                            lock(&gathered).push(candidate.clone());
                            let _ = tx.send(MediaEvent::LocalCandidate {
                                connection_id: cid,
                                candidate,
                            });
                        }
                    }
                    None => {
                        debug!("ICE candidate gathering completed for {}", cid);
                        analyze_candidates(&lock(&gathered));
                    }
                }
            })
        }));

        let cid = connection_id.clone();
        let tx = events.clone();
        let remote_tracks: Arc<Mutex<Vec<RemoteTrack>>> = Arc::new(Mutex::new(Vec::new()));
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            info!("Remote {} track {} on {}", kind, track.id(), cid);
            let stream = {
                let mut tracks = lock(&remote_tracks);
                tracks.push(RemoteTrack {
                    id: track.id(),
                    kind,
                    source: Some(track.clone()),
                });
                RemoteStream {
                    id: track.stream_id(),
                    tracks: tracks.clone(),
                }
            };
            let _ = tx.send(MediaEvent::RemoteStream {
                connection_id: cid.clone(),
                stream,
            });
            Box::pin(async {})
        }));

        let cid = connection_id.clone();
        let grace = self.grace_period;
        let pc_weak = Arc::downgrade(&pc);
        let disconnect_task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection {} state changed to: {:?}", cid, st);
            let report = |state: LinkState| {
                let _ = events.send(MediaEvent::LinkState {
                    connection_id: cid.clone(),
                    state,
                });
            };

            match st {
                RTCPeerConnectionState::Connected => {
                    if let Some(handle) = lock(&disconnect_task).take() {
                        debug!("Aborting pending disconnect task for {}", cid);
                        handle.abort();
                    }
                    report(LinkState::Connected);
                }

                RTCPeerConnectionState::Disconnected => {
                    let mut pending = lock(&disconnect_task);
                    if pending.as_ref().is_some_and(|h| !h.is_finished()) {
                        debug!("Disconnect task already pending for {}", cid);
                    } else {
                        if let Some(pc) = pc_weak.upgrade() {
                            tokio::spawn(async move {
                                dump_selected_pair(&pc, "BEFORE-FAIL").await;
                            });
                        }
                        report(LinkState::Interrupted);

                        let pc_weak = pc_weak.clone();
                        let events = events.clone();
                        let cid = cid.clone();
                        *pending = Some(tokio::spawn(async move {
                            info!("Grace period started for {}, waiting {} s", cid, grace.as_secs());
                            sleep(grace).await;
                            let state_now = pc_weak
                                .upgrade()
                                .map(|pc| pc.connection_state())
                                .unwrap_or(RTCPeerConnectionState::Closed);
                            info!("Grace over for {} => state={:?}", cid, state_now);
                            if state_now != RTCPeerConnectionState::Connected {
                                let _ = events.send(MediaEvent::LinkState {
                                    connection_id: cid,
                                    state: LinkState::Failed,
                                });
                            }
                        }));
                    }
                }

                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    if let Some(handle) = lock(&disconnect_task).take() {
                        handle.abort();
                    }
                    report(if st == RTCPeerConnectionState::Failed {
                        LinkState::Failed
                    } else {
                        LinkState::Closed
                    });
                }

                _ => {}
            }
            Box::pin(async {})
        }));

        lock(&self.peers).insert(connection_id.clone(), pc.clone());
        Ok(pc)
    }

    async fn flush_pending(&self, connection_id: &ConnectionId, pc: &RTCPeerConnection) {
        let queued = lock(&self.pending).take(connection_id);
        if !queued.is_empty() {
            info!("Applying {} queued candidates for {}", queued.len(), connection_id);
            apply_pending_candidates(pc, queued).await;
        }
    }
}

/// Peer connection configuration for the given ICE servers.
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

#[async_trait]
impl MediaNegotiator for RtcNegotiator {
    async fn create_offer(
        &self,
        connection_id: &ConnectionId,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError> {
        let pc = self.new_peer(connection_id, local, events).await?;
        debug!("Creating offer for {}", connection_id);
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        let local_desc = pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        Ok(SessionDescription::offer(local_desc.sdp))
    }

    async fn accept_offer(
        &self,
        connection_id: &ConnectionId,
        offer: &SessionDescription,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError> {
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        let pc = self.new_peer(connection_id, local, events).await?;
        pc.set_remote_description(remote).await?;
        self.flush_pending(connection_id, &pc).await;

        debug!("Creating answer for {}", connection_id);
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        let local_desc = pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        Ok(SessionDescription::answer(local_desc.sdp))
    }

    async fn apply_answer(
        &self,
        connection_id: &ConnectionId,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let pc = self.peer(connection_id)?;
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(remote).await?;
        self.flush_pending(connection_id, &pc).await;
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let pc = lock(&self.peers).get(connection_id).cloned();
        match pc {
            Some(pc) if pc.remote_description().await.is_some() => {
                pc.add_ice_candidate(to_rtc_candidate(candidate)).await?;
            }
            _ => lock(&self.pending).push(connection_id, candidate),
        }
        Ok(())
    }

    async fn close(&self, connection_id: &ConnectionId) {
        lock(&self.pending).discard(connection_id);
        let pc = lock(&self.peers).remove(connection_id);
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!("Error closing peer connection {}: {:?}", connection_id, e);
            }
        }
    }
}
