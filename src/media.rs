//! Local and remote media streams, the platform capture seam, and
//! playback sinks.
//!
//! A [`LocalStream`] is owned by exactly one call session. It is not
//! `Clone`; dropping it stops every track, so a session that goes away
//! on any path releases the capture devices with it.

use crate::error::MediaAccessError;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// What to ask the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ========== LOCAL TRACKS ==========

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    rtp: Arc<TrackLocalStaticSample>,
}

/// Handle to one captured track. Clones share the same flags.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, stream_id: &str, label: impl Into<String>) -> Self {
        let id = format!("{}-{}", kind, random_id());
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.ended.load(Ordering::SeqCst)
    }

    /// Ends the track. Further samples are dropped; cannot be undone.
    pub fn stop(&self) {
        if !self.inner.ended.swap(true, Ordering::SeqCst) {
            debug!("Stopped {} track {}", self.inner.kind, self.inner.id);
        }
    }

    /// The RTP-side track handed to peer connections.
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtp.clone()
    }

    /// Pushes one encoded frame from the capture device. Disabled or
    /// ended tracks drop the frame instead of sending it.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, webrtc::Error> {
        if !self.is_live() || !self.is_enabled() {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner.rtp.write_sample(&sample).await?;
        self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.inner.id.clone(),
            kind: self.inner.kind,
            enabled: self.is_enabled(),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Media captured from this device. Owned by one session; dropping it
/// stops all tracks.
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_tracks().for_each(|t| t.set_enabled(enabled));
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_tracks().for_each(|t| t.set_enabled(enabled));
    }

    pub fn active_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn is_live(&self) -> bool {
        self.active_track_count() > 0
    }

    /// Stops every track. Safe to call more than once.
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            tracks: self.tracks.iter().map(MediaTrack::info).collect(),
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ========== REMOTE STREAMS ==========

#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    /// Present when the track came from a real peer connection.
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rtp", &self.source.is_some())
            .finish()
    }
}

/// Media received from the counterpart.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackInfo {
                    id: t.id.clone(),
                    kind: t.kind,
                    enabled: true,
                })
                .collect(),
        }
    }
}

// ========== CAPTURE ==========

/// Platform media capture (camera + microphone).
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError>;
}

/// Headless capture: hands out Opus/VP8 tracks without touching any
/// device. Frames are pushed by whoever owns the tracks.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    deny: AtomicBool,
    requests: AtomicU64,
    issued: Mutex<Vec<MediaTrack>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the user refusing the permission prompt.
    pub fn denying() -> Self {
        let capture = Self::default();
        capture.deny.store(true, Ordering::SeqCst);
        capture
    }

    pub fn set_denied(&self, denied: bool) {
        self.deny.store(denied, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Every track handed out so far, including stopped ones.
    pub fn issued_tracks(&self) -> Vec<MediaTrack> {
        self.issued.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn live_track_count(&self) -> usize {
        self.issued_tracks().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaAccessError::PermissionDenied);
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaAccessError::Aborted("no media kinds requested".into()));
        }

        let stream_id = random_id();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, &stream_id, "synthetic microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, &stream_id, "synthetic camera"));
        }
        if let Ok(mut issued) = self.issued.lock() {
            issued.extend(tracks.iter().cloned());
        }
        info!("Captured synthetic stream {} ({} tracks)", stream_id, tracks.len());
        Ok(LocalStream::new(stream_id, tracks))
    }
}

// ========== SINKS ==========

#[derive(Debug, Clone)]
pub enum StreamSource {
    Local(StreamInfo),
    Remote(RemoteStream),
}

impl StreamSource {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamSource::Local(info) => &info.id,
            StreamSource::Remote(stream) => &stream.id,
        }
    }
}

/// Where a bound stream is rendered (video element equivalent).
pub trait PlaybackSink: Send + Sync {
    fn play(&self, source: StreamSource);
    fn stop(&self);
}

/// Sink that remembers what it is showing.
#[derive(Debug, Default)]
pub struct SinkSlot {
    name: String,
    current: Mutex<Option<StreamSource>>,
    plays: AtomicU64,
}

impl SinkSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn current(&self) -> Option<StreamSource> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    pub fn current_stream_id(&self) -> Option<String> {
        self.current().map(|s| s.stream_id().to_string())
    }

    pub fn play_count(&self) -> u64 {
        self.plays.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for SinkSlot {
    fn play(&self, source: StreamSource) {
        info!("[{}] playing stream {}", self.name, source.stream_id());
        if let Ok(mut current) = self.current.lock() {
            *current = Some(source);
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        if let Ok(mut current) = self.current.lock() {
            if current.take().is_some() {
                info!("[{}] playback stopped", self.name);
            }
        }
    }
}
