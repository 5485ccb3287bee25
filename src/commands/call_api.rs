use crate::peer::types::SignalingIdentity;
use crate::relay::IdentityClient;
use crate::session::{CallHandle, Command, ManagerSnapshot};
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

/// Front-end handle on a running call session manager. Every method is
/// answered by the dispatch loop; once it has stopped they return the
/// "nothing happened" value.
#[derive(Clone)]
pub struct CallController {
    commands: mpsc::Sender<Command>,
    identity: IdentityClient,
}

impl CallController {
    pub fn new(commands: mpsc::Sender<Command>, identity: IdentityClient) -> Self {
        Self { commands, identity }
    }

    pub(crate) fn identity(&self) -> &IdentityClient {
        &self.identity
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).await.is_err() {
            debug!("Call session manager is gone");
            return None;
        }
        rx.await.ok()
    }

    /// Places an outbound call. `None` when the call could not be placed,
    /// for instance without a relay connection.
    pub async fn call_peer(&self, peer: impl Into<SignalingIdentity>) -> Option<CallHandle> {
        let peer = peer.into();
        info!("call_peer called with: {}", peer);
        self.ask(|reply| Command::Call { peer, reply }).await.flatten()
    }

    pub async fn toggle_mute(&self) -> Option<bool> {
        self.ask(Command::ToggleMute).await.flatten()
    }

    pub async fn toggle_camera(&self) -> Option<bool> {
        self.ask(Command::ToggleCamera).await.flatten()
    }

    pub async fn hang_up(&self) -> bool {
        self.ask(Command::HangUp).await.unwrap_or(false)
    }

    pub async fn status(&self) -> Option<ManagerSnapshot> {
        self.ask(Command::Status).await
    }

    /// Closes every session and the relay connection. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        let _ = self.ask(Command::Shutdown).await;
        self.identity.close().await;
    }
}
