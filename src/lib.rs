pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

use crate::commands::CallController;
use crate::config::ClientConfig;
use crate::logger::Emitter;
use crate::media::{MediaCapture, SinkSlot, SyntheticCapture};
use crate::peer::types::ServerConfig;
use crate::peer::{MediaNegotiator, RtcNegotiator};
use crate::relay::{IdentityClient, RelayConnector, WsConnector};
use crate::session::{spawn_manager, CallSessionManager, Sinks};
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

pub use error::{CallError, ConfigError, MediaAccessError, NegotiationError, RelayError};

/// Opens the relay connection and starts a call session manager on it.
pub fn start(
    config: &ClientConfig,
    connector: Arc<dyn RelayConnector>,
    capture: Arc<dyn MediaCapture>,
    negotiator: Arc<dyn MediaNegotiator>,
    sinks: Sinks,
    emitter: Emitter,
) -> (CallController, JoinHandle<()>) {
    let (identity, relay_events) = IdentityClient::open(connector, config.relay.clone());
    let manager =
        CallSessionManager::new(identity.clone(), capture, negotiator, sinks, emitter, config);
    let (commands, handle) = spawn_manager(manager, relay_events);
    (CallController::new(commands, identity), handle)
}

/// Console entry point. Reads configuration from the environment and
/// commands from stdin.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    logger::init();
    let config = ClientConfig::from_env()?;
    info!(
        "Starting as {:?}, relay {}:{}{}",
        config.role, config.relay.host, config.relay.port, config.relay.path
    );

    let emitter = Emitter::new();
    let negotiator = RtcNegotiator::new(config.ice_servers.clone(), config.grace_period)?;
    let sinks = Sinks {
        local: Arc::new(SinkSlot::new("preview")),
        remote: Arc::new(SinkSlot::new("remote")),
    };
    let (controller, handle) = start(
        &config,
        Arc::new(WsConnector::new()),
        Arc::new(SyntheticCapture::new()),
        Arc::new(negotiator),
        sinks,
        emitter.clone(),
    );

    let mut events = emitter.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("event: {}", json);
            }
        }
    });

    console(&controller).await;
    controller.shutdown().await;
    if let Err(e) = handle.await {
        error!("Call session manager task failed: {}", e);
    }
    Ok(())
}

async fn console(controller: &CallController) {
    println!("commands: id | call <peer-id> | mute | camera | hangup | status | ice <url> | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(controller, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
}

/// Runs one console command. Returns false to quit.
async fn handle_line(controller: &CallController, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("id"), _) => match controller.peer_id() {
            Some(id) => println!("{}", id),
            None => println!("no identity yet"),
        },
        (Some("call"), Some(peer)) => match controller.call_peer(peer).await {
            Some(handle) => println!("calling {} ({})", handle.remote, handle.connection_id),
            None => println!("call not placed"),
        },
        (Some("mute"), _) => match controller.toggle_mute().await {
            Some(muted) => println!("muted: {}", muted),
            None => println!("no active call"),
        },
        (Some("camera"), _) => match controller.toggle_camera().await {
            Some(enabled) => println!("camera: {}", if enabled { "on" } else { "off" }),
            None => println!("no active call"),
        },
        (Some("hangup"), _) => {
            if !controller.hang_up().await {
                println!("no active call");
            }
        }
        (Some("status"), _) => {
            if let Some(snapshot) = controller.status().await {
                match serde_json::to_string_pretty(&snapshot) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("status: {}", e),
                }
            }
        }
        (Some("ice"), Some(url)) => {
            let server = ServerConfig {
                id: "cli-check".into(),
                r#type: if url.starts_with("turn") { "turn" } else { "stun" }.into(),
                url: url.to_string(),
                username: parts.next().map(str::to_string),
                credential: parts.next().map(str::to_string),
            };
            match controller.check_ice_server(server).await {
                Ok(ok) => println!("{}: {}", url, if ok { "reachable" } else { "unreachable" }),
                Err(e) => println!("{}", e),
            }
        }
        (Some("quit" | "exit"), _) => return false,
        (Some(other), _) => println!("unknown command: {}", other),
    }
    true
}
