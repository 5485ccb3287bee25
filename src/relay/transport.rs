//! Relay transport abstraction.
//!
//! The identity client talks to the relay through these traits so the
//! same signaling logic runs over the real WebSocket relay and the
//! in-process [`MemoryRelay`](super::memory::MemoryRelay).

use crate::config::{dev, RelayConfig};
use crate::error::RelayError;
use crate::peer::types::SignalingIdentity;
use crate::signaling::RelayMessage;
use crate::utils::random_token;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Outbound half of an open relay connection.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send(&self, msg: RelayMessage) -> Result<(), RelayError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A connection the relay accepted: our identity, a way to send, and the
/// frames the relay pushes to us. The inbound channel ends when the
/// connection does.
pub struct RelayLink {
    pub id: SignalingIdentity,
    pub transport: Arc<dyn RelayTransport>,
    pub inbound: mpsc::Receiver<RelayMessage>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, config: &RelayConfig) -> Result<RelayLink, RelayError>;
}

// ========== WEBSOCKET ==========

/// Connects to a PeerJS-compatible relay: fetches an id over HTTP, then
/// opens the signaling socket and waits for `OPEN`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    http: reqwest::Client,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fetch_id(&self, config: &RelayConfig) -> Result<SignalingIdentity, RelayError> {
        let url = config.id_url();
        debug!("Requesting relay id from {}", url);
        let id = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let id = id.trim();
        if id.is_empty() {
            return Err(RelayError::Server("relay returned an empty id".into()));
        }
        Ok(SignalingIdentity::new(id))
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, config: &RelayConfig) -> Result<RelayLink, RelayError> {
        let id = self.fetch_id(config).await?;
        let url = config.socket_url(id.as_str(), &random_token(10));
        info!("Connecting to relay: {}", url);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // The relay confirms the id with OPEN (or refuses it) before anything else
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match RelayMessage::decode(text.as_str())? {
                    RelayMessage::Open => break,
                    RelayMessage::IdTaken { .. } => {
                        return Err(RelayError::Server(format!("id {} is taken", id)))
                    }
                    RelayMessage::InvalidKey { .. } => {
                        return Err(RelayError::Server(format!("invalid key {}", config.key)))
                    }
                    RelayMessage::Error { payload } => return Err(RelayError::Server(payload.msg)),
                    other => debug!("Ignoring {} before OPEN", other.kind()),
                },
                Some(Ok(Message::Close(_))) | None => return Err(RelayError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let (in_tx, in_rx) = mpsc::channel::<RelayMessage>(64);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match RelayMessage::decode(text.as_str()) {
                        Ok(msg) => {
                            if dev::TRACE_FRAMES {
                                debug!("relay -> {}", text.as_str());
                            }
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay socket error: {}", e);
                        break;
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
        });

        Ok(RelayLink {
            id,
            transport: Arc::new(WsTransport { out: out_tx, closed }),
            inbound: in_rx,
        })
    }
}

struct WsTransport {
    out: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn send(&self, msg: RelayMessage) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let text = msg.encode()?;
        if dev::TRACE_FRAMES {
            debug!("relay <- {}", text);
        }
        self.out
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| RelayError::Closed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.out.send(Message::Close(None)).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
