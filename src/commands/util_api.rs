use crate::commands::CallController;
use crate::error::ConfigError;
use crate::peer::ice::{check_ice_server_availability, validate_ice_servers};
use crate::peer::types::{ServerConfig, SignalingIdentity};
use log::info;
use std::time::Duration;

/// How long an ICE server check waits for a usable candidate.
const ICE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

impl CallController {
    /// The identity to share with the other side, once assigned.
    pub fn peer_id(&self) -> Option<SignalingIdentity> {
        self.identity().identity()
    }

    /// Whether the relay connection is open.
    pub fn is_connected(&self) -> bool {
        self.identity().is_open()
    }

    /// Checks one STUN/TURN server.
    pub async fn check_ice_server(&self, config: ServerConfig) -> Result<bool, ConfigError> {
        validate_ice_servers(std::slice::from_ref(&config))?;
        info!("check_ice_server called for {}", config.url);
        Ok(check_ice_server_availability(&config, ICE_CHECK_TIMEOUT).await)
    }
}
