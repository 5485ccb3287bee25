//! In-process negotiator.
//!
//! Exchanges a small synthetic SDP that only lists the stream and its
//! tracks, and reports the counterpart's stream as remote media as soon
//! as both descriptions are known. Used by tests and offline demos.

use crate::error::NegotiationError;
use crate::media::{LocalStream, MediaTrack, RemoteStream, RemoteTrack, SinkSlot, TrackKind};
use crate::peer::negotiator::{LinkState, MediaEvent, MediaEvents, MediaNegotiator};
use crate::peer::types::{ConnectionId, IceCandidate, SessionDescription};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One negotiator call, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorCall {
    Offer {
        connection_id: ConnectionId,
        local_stream: String,
    },
    Accept {
        connection_id: ConnectionId,
        local_stream: String,
        /// What the observed preview sink was showing at that moment.
        preview: Option<String>,
    },
    Answer {
        connection_id: ConnectionId,
    },
    Close {
        connection_id: ConnectionId,
    },
}

#[derive(Default)]
struct LinkEntry {
    events: Option<MediaEvents>,
    remote_set: bool,
    held: Option<RemoteStream>,
    pending: Vec<IceCandidate>,
    applied: Vec<IceCandidate>,
}

#[derive(Default)]
pub struct LoopbackNegotiator {
    links: Mutex<HashMap<ConnectionId, LinkEntry>>,
    journal: Mutex<Vec<NegotiatorCall>>,
    hold_remote: AtomicBool,
    reject_offers: AtomicBool,
    preview: Mutex<Option<Arc<SinkSlot>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Synthetic SDP: one `a=msid` line per track.
pub fn describe(stream: &LocalStream) -> String {
    let mut sdp = String::from("v=0\r\ns=loopback\r\n");
    for track in stream.tracks() {
        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {}\r\n",
            track.kind(),
            stream.id(),
            track.id()
        ));
    }
    sdp
}

/// Reads back what [`describe`] wrote.
pub fn parse(sdp: &str) -> Result<RemoteStream, NegotiationError> {
    let mut stream_id = None;
    let mut tracks = Vec::new();
    let mut kind = None;
    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
        } else if let Some(msid) = line.strip_prefix("a=msid:") {
            let mut parts = msid.split_whitespace();
            let (Some(stream), Some(track), Some(kind)) = (parts.next(), parts.next(), kind)
            else {
                return Err(NegotiationError::InvalidSdp(format!("bad msid line: {}", line)));
            };
            stream_id.get_or_insert_with(|| stream.to_string());
            tracks.push(RemoteTrack {
                id: track.to_string(),
                kind,
                source: None,
            });
        }
    }
    match stream_id {
        Some(id) if !tracks.is_empty() => Ok(RemoteStream { id, tracks }),
        _ => Err(NegotiationError::InvalidSdp("no media sections".into())),
    }
}

impl LoopbackNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps remote media back until [`release_remote`](Self::release_remote).
    pub fn hold_remote_media(&self, hold: bool) {
        self.hold_remote.store(hold, Ordering::SeqCst);
    }

    pub fn reject_offers(&self, reject: bool) {
        self.reject_offers.store(reject, Ordering::SeqCst);
    }

    /// Records what this sink shows whenever an offer is accepted.
    pub fn observe_preview(&self, sink: Arc<SinkSlot>) {
        *lock(&self.preview) = Some(sink);
    }

    /// Delivers held remote media. Returns false when nothing was held.
    pub fn release_remote(&self, connection_id: &ConnectionId) -> bool {
        let mut links = lock(&self.links);
        let Some(link) = links.get_mut(connection_id) else {
            return false;
        };
        match (link.held.take(), &link.events) {
            (Some(stream), Some(events)) => {
                let _ = events.send(MediaEvent::RemoteStream {
                    connection_id: connection_id.clone(),
                    stream,
                });
                true
            }
            _ => false,
        }
    }

    /// Reports a link state change as the real negotiator would.
    pub fn report_link(&self, connection_id: &ConnectionId, state: LinkState) {
        if let Some(events) = lock(&self.links)
            .get(connection_id)
            .and_then(|l| l.events.clone())
        {
            let _ = events.send(MediaEvent::LinkState {
                connection_id: connection_id.clone(),
                state,
            });
        }
    }

    pub fn journal(&self) -> Vec<NegotiatorCall> {
        lock(&self.journal).clone()
    }

    pub fn open_links(&self) -> usize {
        lock(&self.links).values().filter(|l| l.events.is_some()).count()
    }

    pub fn pending_candidates(&self, connection_id: &ConnectionId) -> usize {
        lock(&self.links)
            .get(connection_id)
            .map_or(0, |l| l.pending.len())
    }

    pub fn applied_candidates(&self, connection_id: &ConnectionId) -> usize {
        lock(&self.links)
            .get(connection_id)
            .map_or(0, |l| l.applied.len())
    }

    fn record(&self, call: NegotiatorCall) {
        debug!("loopback: {:?}", call);
        lock(&self.journal).push(call);
    }

    /// Marks the remote description as set, applies held candidates and
    /// delivers (or holds) the remote stream.
    fn remote_known(&self, connection_id: &ConnectionId, remote: RemoteStream) {
        let hold = self.hold_remote.load(Ordering::SeqCst);
        let mut links = lock(&self.links);
        let link = links.entry(connection_id.clone()).or_default();
        link.remote_set = true;
        let queued = std::mem::take(&mut link.pending);
        link.applied.extend(queued);

        if hold {
            link.held = Some(remote);
        } else if let Some(events) = &link.events {
            let _ = events.send(MediaEvent::LinkState {
                connection_id: connection_id.clone(),
                state: LinkState::Connected,
            });
            let _ = events.send(MediaEvent::RemoteStream {
                connection_id: connection_id.clone(),
                stream: remote,
            });
        }
    }

    fn open_link(&self, connection_id: &ConnectionId, local: &LocalStream, events: MediaEvents) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                40000 + local.tracks().len()
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = events.send(MediaEvent::LocalCandidate {
            connection_id: connection_id.clone(),
            candidate,
        });
        lock(&self.links)
            .entry(connection_id.clone())
            .or_default()
            .events = Some(events);
    }
}

#[async_trait]
impl MediaNegotiator for LoopbackNegotiator {
    async fn create_offer(
        &self,
        connection_id: &ConnectionId,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError> {
        self.record(NegotiatorCall::Offer {
            connection_id: connection_id.clone(),
            local_stream: local.id().to_string(),
        });
        self.open_link(connection_id, local, events);
        Ok(SessionDescription::offer(describe(local)))
    }

    async fn accept_offer(
        &self,
        connection_id: &ConnectionId,
        offer: &SessionDescription,
        local: &LocalStream,
        events: MediaEvents,
    ) -> Result<SessionDescription, NegotiationError> {
        let preview = lock(&self.preview)
            .as_ref()
            .and_then(|sink| sink.current_stream_id());
        self.record(NegotiatorCall::Accept {
            connection_id: connection_id.clone(),
            local_stream: local.id().to_string(),
            preview,
        });
        if self.reject_offers.load(Ordering::SeqCst) {
            return Err(NegotiationError::InvalidSdp("offer rejected".into()));
        }
        let remote = parse(&offer.sdp)?;
        self.open_link(connection_id, local, events);
        self.remote_known(connection_id, remote);
        Ok(SessionDescription::answer(describe(local)))
    }

    async fn apply_answer(
        &self,
        connection_id: &ConnectionId,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        if !lock(&self.links).contains_key(connection_id) {
            return Err(NegotiationError::UnknownConnection(connection_id.to_string()));
        }
        self.record(NegotiatorCall::Answer {
            connection_id: connection_id.clone(),
        });
        let remote = parse(&answer.sdp)?;
        self.remote_known(connection_id, remote);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        connection_id: &ConnectionId,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        let mut links = lock(&self.links);
        let link = links.entry(connection_id.clone()).or_default();
        if link.remote_set {
            link.applied.push(candidate);
        } else {
            link.pending.push(candidate);
        }
        Ok(())
    }

    async fn close(&self, connection_id: &ConnectionId) {
        if lock(&self.links).remove(connection_id).is_some() {
            self.record(NegotiatorCall::Close {
                connection_id: connection_id.clone(),
            });
        }
    }
}

/// Local stream as the far end would see it, for wiring two loopback
/// sides together by hand.
pub fn remote_view(stream: &LocalStream) -> RemoteStream {
    RemoteStream {
        id: stream.id().to_string(),
        tracks: stream
            .tracks()
            .iter()
            .map(|t: &MediaTrack| RemoteTrack {
                id: t.id().to_string(),
                kind: t.kind(),
                source: None,
            })
            .collect(),
    }
}
