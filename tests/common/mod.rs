#![allow(dead_code)]

use async_trait::async_trait;
use guardian_angel_lib::commands::CallController;
use guardian_angel_lib::config::{ClientConfig, RelayConfig, Role};
use guardian_angel_lib::logger::{AppEvent, Emitter};
use guardian_angel_lib::media::{
    LocalStream, MediaCapture, MediaConstraints, SinkSlot, SyntheticCapture,
};
use guardian_angel_lib::peer::loopback::describe;
use guardian_angel_lib::peer::{ConnectionId, LoopbackNegotiator, SessionDescription, SignalingIdentity};
use guardian_angel_lib::relay::{MemoryRelay, RelayConnector, RelayLink};
use guardian_angel_lib::session::{ManagerSnapshot, Sinks};
use guardian_angel_lib::signaling::{RelayMessage, SdpPayload};
use guardian_angel_lib::MediaAccessError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn relay_config() -> RelayConfig {
    RelayConfig::from_origin("http://localhost:3000").unwrap()
}

/// Capture whose permission prompt stays up until `release` is called.
pub struct GatedCapture {
    pub inner: SyntheticCapture,
    gate: Option<Semaphore>,
    asked: AtomicU64,
}

impl GatedCapture {
    pub fn open() -> Self {
        Self {
            inner: SyntheticCapture::new(),
            gate: None,
            asked: AtomicU64::new(0),
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::open()
        }
    }

    pub fn denying() -> Self {
        Self {
            inner: SyntheticCapture::denying(),
            ..Self::open()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    pub fn asked(&self) -> u64 {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for GatedCapture {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, MediaAccessError> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(MediaAccessError::Aborted("gate closed".into())),
            }
        }
        self.inner.get_user_media(constraints).await
    }
}

#[derive(Default)]
pub struct NodeOptions {
    pub role: Role,
    pub call_timeout: Option<Duration>,
    pub capture: Option<GatedCapture>,
}

/// One running client: manager, controller and the fakes behind it.
pub struct Node {
    pub controller: CallController,
    pub handle: JoinHandle<()>,
    pub capture: Arc<GatedCapture>,
    pub negotiator: Arc<LoopbackNegotiator>,
    pub preview: Arc<SinkSlot>,
    pub remote: Arc<SinkSlot>,
    pub emitter: Emitter,
}

pub fn spawn_node(relay: &MemoryRelay, id: &str, options: NodeOptions) -> Node {
    relay.script_id(id);
    let config = ClientConfig::new(relay_config())
        .with_role(options.role)
        .with_call_timeout(options.call_timeout);
    let capture = Arc::new(options.capture.unwrap_or_else(GatedCapture::open));
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let preview = Arc::new(SinkSlot::new(format!("{}-preview", id)));
    let remote = Arc::new(SinkSlot::new(format!("{}-remote", id)));
    let emitter = Emitter::new();

    let (controller, handle) = guardian_angel_lib::start(
        &config,
        Arc::new(relay.clone()),
        capture.clone(),
        negotiator.clone(),
        Sinks {
            local: preview.clone(),
            remote: remote.clone(),
        },
        emitter.clone(),
    );
    Node {
        controller,
        handle,
        capture,
        negotiator,
        preview,
        remote,
        emitter,
    }
}

impl Node {
    pub async fn ready(&self) {
        let deadline = Instant::now() + WAIT;
        while self.controller.peer_id().is_none() {
            assert!(Instant::now() < deadline, "relay identity never assigned");
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn eventually(
        &self,
        what: &str,
        check: impl Fn(&ManagerSnapshot) -> bool,
    ) -> ManagerSnapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(snapshot) = self.controller.status().await {
                if check(&snapshot) {
                    return snapshot;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A bare relay client standing in for the other side of a call.
pub struct RawPeer {
    pub id: SignalingIdentity,
    pub link: RelayLink,
}

pub async fn raw_peer(relay: &MemoryRelay, id: &str) -> RawPeer {
    relay.script_id(id);
    let mut link = relay.connect(&relay_config()).await.unwrap();
    assert_eq!(link.inbound.recv().await, Some(RelayMessage::Open));
    RawPeer {
        id: link.id.clone(),
        link,
    }
}

impl RawPeer {
    pub async fn send(&self, msg: RelayMessage) {
        self.link.transport.send(msg).await.unwrap();
    }

    /// Sends an OFFER describing `stream` and returns the connection id.
    pub async fn offer(&self, to: &str, stream: &LocalStream) -> ConnectionId {
        let connection_id = ConnectionId::generate();
        self.send(RelayMessage::offer(
            SignalingIdentity::from(to),
            SdpPayload::media(
                connection_id.clone(),
                SessionDescription::offer(describe(stream)),
            ),
        ))
        .await;
        connection_id
    }

    /// Next frame of the given type, skipping others.
    pub async fn next_of_kind(&mut self, kind: &str) -> RelayMessage {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match timeout(left, self.link.inbound.recv()).await {
                Ok(Some(msg)) if msg.kind() == kind => return msg,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("relay link closed while waiting for {}", kind),
                Err(_) => panic!("timed out waiting for {}", kind),
            }
        }
    }
}

pub async fn capture_stream() -> LocalStream {
    SyntheticCapture::new()
        .get_user_media(MediaConstraints::default())
        .await
        .unwrap()
}

/// Waits for the first event that satisfies `check`, skipping the rest.
pub async fn next_event(
    events: &mut broadcast::Receiver<AppEvent>,
    what: &str,
    check: impl Fn(&AppEvent) -> bool,
) -> AppEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match timeout(left, events.recv()).await {
            Ok(Ok(event)) if check(&event) => return event,
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("emitter closed while waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}
