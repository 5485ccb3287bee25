//! In-process relay for tests and offline runs.
//!
//! Behaves like the real relay as far as clients can tell: assigns ids,
//! greets with `OPEN`, stamps `src` on forwarded frames and answers
//! frames for unknown destinations with `EXPIRE`.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::peer::types::SignalingIdentity;
use crate::relay::transport::{RelayConnector, RelayLink, RelayTransport};
use crate::signaling::RelayMessage;
use crate::utils::random_token;
use async_trait::async_trait;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Default)]
struct RelayState {
    online: bool,
    peers: HashMap<SignalingIdentity, mpsc::Sender<RelayMessage>>,
    scripted_ids: VecDeque<String>,
    frames: Vec<RelayMessage>,
    heartbeats: usize,
}

#[derive(Clone)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                online: true,
                ..Default::default()
            })),
        }
    }

    /// A relay that refuses every connection.
    pub fn offline() -> Self {
        let relay = Self::new();
        relay.set_online(false);
        relay
    }

    fn state(&self) -> MutexGuard<'_, RelayState> {
        // A poisoned lock only means a test panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// The next connection gets this id instead of a random one.
    pub fn script_id(&self, id: impl Into<String>) {
        self.state().scripted_ids.push_back(id.into());
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.state().peers.contains_key(&SignalingIdentity::from(id))
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Every signaling frame routed so far (heartbeats excluded), with
    /// `src` stamped.
    pub fn frames(&self) -> Vec<RelayMessage> {
        self.state().frames.clone()
    }

    pub fn frames_of_kind(&self, kind: &str) -> Vec<RelayMessage> {
        self.frames()
            .into_iter()
            .filter(|f| f.kind() == kind)
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.state().heartbeats
    }

    /// Drops a client's socket as if the network went away.
    pub fn disconnect(&self, id: &str) {
        if self
            .state()
            .peers
            .remove(&SignalingIdentity::from(id))
            .is_some()
        {
            info!("Memory relay dropped {}", id);
        }
    }

    async fn route(&self, from: &SignalingIdentity, msg: RelayMessage) -> Result<(), RelayError> {
        if matches!(msg, RelayMessage::Heartbeat) {
            self.state().heartbeats += 1;
            return Ok(());
        }

        let msg = msg.with_src(from.clone());
        let (target, sender) = {
            let mut state = self.state();
            state.frames.push(msg.clone());
            let target = msg.dst().cloned();
            let sender = target.as_ref().and_then(|dst| state.peers.get(dst).cloned());
            (target, sender)
        };

        match (target, sender) {
            (Some(_), Some(tx)) => {
                let _ = tx.send(msg).await;
            }
            (Some(dst), None) => {
                debug!("Memory relay: {} is gone, expiring {}", dst, msg.kind());
                let back = self.state().peers.get(from).cloned();
                if let Some(back) = back {
                    let _ = back
                        .send(RelayMessage::Expire {
                            src: Some(dst),
                            dst: Some(from.clone()),
                        })
                        .await;
                }
            }
            (None, _) => debug!("Memory relay: {} without destination", msg.kind()),
        }
        Ok(())
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, _config: &RelayConfig) -> Result<RelayLink, RelayError> {
        let (tx, rx) = mpsc::channel(64);
        let id = {
            let mut state = self.state();
            if !state.online {
                return Err(RelayError::Connect("relay offline".into()));
            }
            let id = state
                .scripted_ids
                .pop_front()
                .unwrap_or_else(|| random_token(10));
            let id = SignalingIdentity::new(id);
            if state.peers.contains_key(&id) {
                return Err(RelayError::Server(format!("id {} is taken", id)));
            }
            state.peers.insert(id.clone(), tx.clone());
            id
        };
        let _ = tx.send(RelayMessage::Open).await;
        info!("Memory relay assigned {}", id);

        Ok(RelayLink {
            id: id.clone(),
            transport: Arc::new(MemoryTransport {
                id,
                relay: self.clone(),
                closed: AtomicBool::new(false),
            }),
            inbound: rx,
        })
    }
}

struct MemoryTransport {
    id: SignalingIdentity,
    relay: MemoryRelay,
    closed: AtomicBool,
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn send(&self, msg: RelayMessage) -> Result<(), RelayError> {
        if self.is_closed() || !self.relay.is_connected(self.id.as_str()) {
            return Err(RelayError::Closed);
        }
        self.relay.route(&self.id, msg).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.relay.disconnect(self.id.as_str());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
