use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::peer::types::{ConnectionId, IceCandidate, SessionDescription, SignalingIdentity};
use crate::relay::transport::{RelayConnector, RelayTransport};
use crate::signaling::{ConnectionType, RelayMessage};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the relay connection reports to the call manager.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Identity assigned; sent once per connection.
    Open(SignalingIdentity),
    /// The relay could not be reached. No retry follows.
    Unavailable(String),
    IncomingCall {
        connection_id: ConnectionId,
        peer: SignalingIdentity,
        offer: SessionDescription,
    },
    Answer {
        connection_id: ConnectionId,
        peer: SignalingIdentity,
        answer: SessionDescription,
    },
    Candidate {
        connection_id: ConnectionId,
        peer: SignalingIdentity,
        candidate: IceCandidate,
    },
    /// The remote ended one call (`connection_id` set) or left entirely.
    PeerLeft {
        peer: SignalingIdentity,
        connection_id: Option<ConnectionId>,
    },
    /// The relay could not deliver to this peer.
    Expired(SignalingIdentity),
    Error(String),
    /// The socket went away; the identity is no longer valid.
    Disconnected,
}

#[derive(Default)]
struct Shared {
    identity: Mutex<Option<SignalingIdentity>>,
    transport: Mutex<Option<Arc<dyn RelayTransport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Shared {
    /// Marks the client closed and hands back whatever was installed.
    /// Only the first caller gets `Some`.
    fn release(&self) -> Option<Option<Arc<dyn RelayTransport>>> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return None;
        }
        lock(&self.identity).take();
        let transport = lock(&self.transport).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        Some(transport)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Held only by client handles, never by the background tasks, so it
/// drops with the last handle and takes the connection down with it.
struct ReleaseOnDrop(Arc<Shared>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(transport) = self.0.release() else {
            return;
        };
        debug!("Last relay client handle dropped; releasing connection");
        if let (Some(t), Ok(rt)) = (transport, tokio::runtime::Handle::try_current()) {
            rt.spawn(async move { t.close().await });
        }
    }
}

/// Signaling identity client: one relay connection and the id it was
/// given. Clones share the connection.
#[derive(Clone)]
pub struct IdentityClient {
    shared: Arc<Shared>,
    _release: Arc<ReleaseOnDrop>,
}

impl IdentityClient {
    /// Starts connecting in the background and returns right away. The
    /// outcome arrives on the event channel as `Open` or `Unavailable`.
    pub fn open(
        connector: Arc<dyn RelayConnector>,
        config: RelayConfig,
    ) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (events, rx) = mpsc::channel(64);
        let shared = Arc::new(Shared::default());
        let client = Self {
            shared: shared.clone(),
            _release: Arc::new(ReleaseOnDrop(shared)),
        };

        let shared = client.shared.clone();
        let handle = tokio::spawn(async move {
            let link = match connector.connect(&config).await {
                Ok(link) => link,
                Err(e) => {
                    error!("Signaling relay unavailable: {}", e);
                    let _ = events.send(RelayEvent::Unavailable(e.to_string())).await;
                    return;
                }
            };

            // Install first, then check: a close() that ran in between
            // either took these or left `closed` set for us to see
            let id = link.id.clone();
            *lock(&shared.identity) = Some(id.clone());
            *lock(&shared.transport) = Some(link.transport.clone());
            if shared.closed.load(Ordering::SeqCst) {
                lock(&shared.identity).take();
                lock(&shared.transport).take();
                link.transport.close().await;
                return;
            }
            info!("Relay identity assigned: {}", id);
            let _ = events.send(RelayEvent::Open(id)).await;

            let heartbeat = tokio::spawn(heartbeat(
                link.transport.clone(),
                config.heartbeat_interval,
            ));
            lock(&shared.tasks).push(heartbeat);

            let mut inbound = link.inbound;
            while let Some(msg) = inbound.recv().await {
                if let Some(event) = translate(msg) {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }

            let was_open = lock(&shared.identity).take().is_some();
            lock(&shared.transport).take();
            if was_open && !shared.closed.load(Ordering::SeqCst) {
                warn!("Relay connection lost");
                let _ = events.send(RelayEvent::Disconnected).await;
            }
        });
        lock(&client.shared.tasks).push(handle);

        (client, rx)
    }

    /// The assigned identity, while the connection is open.
    pub fn identity(&self) -> Option<SignalingIdentity> {
        lock(&self.shared.identity).clone()
    }

    pub fn is_open(&self) -> bool {
        self.identity().is_some()
    }

    pub async fn send(&self, msg: RelayMessage) -> Result<(), RelayError> {
        let transport = lock(&self.shared.transport).clone();
        match transport {
            Some(t) => t.send(msg).await,
            None => Err(RelayError::Unavailable),
        }
    }

    /// Releases the connection and invalidates the identity. Idempotent.
    pub async fn close(&self) {
        let Some(transport) = self.shared.release() else {
            return;
        };
        if let Some(t) = transport {
            t.close().await;
        }
        info!("Relay connection closed");
    }
}

async fn heartbeat(transport: Arc<dyn RelayTransport>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if transport.send(RelayMessage::Heartbeat).await.is_err() {
            debug!("Heartbeat stopped");
            break;
        }
    }
}

fn translate(msg: RelayMessage) -> Option<RelayEvent> {
    let peer = msg.src().cloned().unwrap_or_default();
    match msg {
        RelayMessage::Offer { payload, .. } => {
            if payload.connection_type != ConnectionType::Media {
                debug!("Ignoring {:?} offer from {}", payload.connection_type, peer);
                return None;
            }
            Some(RelayEvent::IncomingCall {
                connection_id: payload.connection_id,
                peer,
                offer: payload.sdp,
            })
        }
        RelayMessage::Answer { payload, .. } => Some(RelayEvent::Answer {
            connection_id: payload.connection_id,
            peer,
            answer: payload.sdp,
        }),
        RelayMessage::Candidate { payload, .. } => Some(RelayEvent::Candidate {
            connection_id: payload.connection_id,
            peer,
            candidate: payload.candidate,
        }),
        RelayMessage::Leave { payload, .. } => Some(RelayEvent::PeerLeft {
            peer,
            connection_id: payload.map(|p| p.connection_id),
        }),
        RelayMessage::Expire { .. } => Some(RelayEvent::Expired(peer)),
        RelayMessage::Error { payload } => Some(RelayEvent::Error(payload.msg)),
        RelayMessage::IdTaken { .. } => Some(RelayEvent::Error("id taken".into())),
        RelayMessage::InvalidKey { .. } => Some(RelayEvent::Error("invalid key".into())),
        RelayMessage::Open | RelayMessage::Heartbeat => None,
    }
}
