//! Application configuration.
//!
//! Logging is on by default in debug builds and reduced to warnings in
//! release builds; `GUARDIAN_LOG` overrides both.

use crate::error::{ConfigError, RelayError};
use crate::peer::ice::{validate_ice_servers, DEFAULT_ICE_SERVERS};
use crate::peer::types::ServerConfig;
use crate::utils::{normalize_path, random_token};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

pub const LOG_ENV: &str = "GUARDIAN_LOG";

pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";
pub const DEFAULT_RELAY_PATH: &str = "/peerjs/myapp";
pub const DEFAULT_RELAY_KEY: &str = "peerjs";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long a dropped peer link may stay down before the call is failed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

// Extra knobs for development builds
#[cfg(debug_assertions)]
pub mod dev {
    /// Log every relay frame as it is sent and received.
    pub const TRACE_FRAMES: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const TRACE_FRAMES: bool = false;
}

// ========== RELAY ==========

/// Where the relay lives, derived from the page origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
    pub key: String,
    #[serde(skip, default = "default_heartbeat")]
    pub heartbeat_interval: Duration,
}

fn default_heartbeat() -> Duration {
    HEARTBEAT_INTERVAL
}

impl RelayConfig {
    /// Port defaults to 443 for https and 80 otherwise; `secure` iff https.
    pub fn from_origin(origin: &str) -> Result<Self, RelayError> {
        let url = Url::parse(origin).map_err(|e| RelayError::InvalidOrigin(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::InvalidOrigin(format!("{} has no host", origin)))?
            .to_string();
        let secure = url.scheme() == "https";
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });
        Ok(Self {
            host,
            port,
            path: normalize_path(DEFAULT_RELAY_PATH),
            secure,
            key: DEFAULT_RELAY_KEY.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        })
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalize_path(path);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Endpoint that hands out a fresh identifier as plain text.
    pub fn id_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!(
            "{}://{}:{}{}{}/id?ts={}{}",
            scheme,
            self.host,
            self.port,
            self.path,
            self.key,
            chrono::Utc::now().timestamp_millis(),
            random_token(6)
        )
    }

    pub fn socket_url(&self, id: &str, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{}://{}:{}{}peerjs?key={}&id={}&token={}",
            scheme, self.host, self.port, self.path, self.key, id, token
        )
    }
}

// ========== CLIENT ==========

/// Which inbound calls this device answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Baby-side camera: answers inbound calls.
    Camera,
    /// Parent monitor: places calls, ignores inbound offers.
    Monitor,
    #[default]
    Peer,
}

impl Role {
    pub fn answers_inbound(self) -> bool {
        !matches!(self, Role::Monitor)
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(Role::Camera),
            "monitor" => Ok(Role::Monitor),
            "peer" => Ok(Role::Peer),
            other => Err(ConfigError::InvalidValue {
                name: "GUARDIAN_ROLE",
                reason: format!("unknown role {:?}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub relay: RelayConfig,
    pub ice_servers: Vec<ServerConfig>,
    pub role: Role,
    /// Closes sessions stuck in Calling; unset means wait indefinitely.
    #[serde(skip)]
    pub call_timeout: Option<Duration>,
    #[serde(skip, default = "default_grace")]
    pub grace_period: Duration,
}

fn default_grace() -> Duration {
    GRACE_PERIOD
}

impl ClientConfig {
    pub fn new(relay: RelayConfig) -> Self {
        Self {
            relay,
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            role: Role::default(),
            call_timeout: None,
            grace_period: GRACE_PERIOD,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Result<Self, ConfigError> {
        validate_ice_servers(&servers)?;
        self.ice_servers = servers;
        Ok(self)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = lookup("GUARDIAN_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        let mut relay = RelayConfig::from_origin(&origin)?;
        if let Some(path) = lookup("GUARDIAN_RELAY_PATH") {
            relay = relay.with_path(&path);
        }
        if let Some(key) = lookup("GUARDIAN_RELAY_KEY").filter(|k| !k.trim().is_empty()) {
            relay = relay.with_key(key.trim());
        }

        let mut config = Self::new(relay);
        if let Some(role) = lookup("GUARDIAN_ROLE") {
            config.role = role.parse()?;
        }
        if let Some(secs) = lookup("GUARDIAN_CALL_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| ConfigError::InvalidValue {
                name: "GUARDIAN_CALL_TIMEOUT_SECS",
                reason: format!("{:?} is not a number of seconds", secs),
            })?;
            config.call_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(raw) = lookup("GUARDIAN_ICE_SERVERS") {
            let servers: Vec<ServerConfig> =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    name: "GUARDIAN_ICE_SERVERS",
                    reason: e.to_string(),
                })?;
            config = config.with_ice_servers(servers)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn https_origin_defaults_to_443() {
        let relay = RelayConfig::from_origin("https://monitor.example.org").unwrap();
        assert_eq!(relay.host, "monitor.example.org");
        assert_eq!(relay.port, 443);
        assert!(relay.secure);
        assert_eq!(relay.path, "/peerjs/myapp/");
        assert!(relay.socket_url("abc123", "tok").starts_with(
            "wss://monitor.example.org:443/peerjs/myapp/peerjs?key=peerjs&id=abc123&token=tok"
        ));
    }

    #[test]
    fn http_origin_keeps_explicit_port() {
        let relay = RelayConfig::from_origin("http://localhost:3000/dashboard").unwrap();
        assert_eq!(relay.port, 3000);
        assert!(!relay.secure);
        assert!(relay
            .id_url()
            .starts_with("http://localhost:3000/peerjs/myapp/peerjs/id?ts="));

        let plain = RelayConfig::from_origin("http://baby.local").unwrap();
        assert_eq!(plain.port, 80);
    }

    #[test]
    fn bad_origin_is_rejected() {
        assert!(matches!(
            RelayConfig::from_origin("not a url"),
            Err(RelayError::InvalidOrigin(_))
        ));
    }

    #[test]
    fn env_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.relay.host, "localhost");
        assert_eq!(config.role, Role::Peer);
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.ice_servers.len(), DEFAULT_ICE_SERVERS.len());
        assert_eq!(config.grace_period, GRACE_PERIOD);
    }

    #[test]
    fn env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("GUARDIAN_ORIGIN", "https://nursery.example.org:8443"),
            ("GUARDIAN_RELAY_PATH", "signal"),
            ("GUARDIAN_ROLE", "Monitor"),
            ("GUARDIAN_CALL_TIMEOUT_SECS", "30"),
            (
                "GUARDIAN_ICE_SERVERS",
                r#"[{"id":"s","type":"stun","url":"stun.example.org:3478"}]"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.relay.port, 8443);
        assert_eq!(config.relay.path, "/signal/");
        assert_eq!(config.role, Role::Monitor);
        assert!(!config.role.answers_inbound());
        assert_eq!(config.call_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.ice_servers[0].url, "stun.example.org:3478");
    }

    #[test]
    fn invalid_env_values_are_reported() {
        assert!(ClientConfig::from_lookup(lookup(&[("GUARDIAN_ROLE", "nanny")])).is_err());
        assert!(
            ClientConfig::from_lookup(lookup(&[("GUARDIAN_CALL_TIMEOUT_SECS", "soon")])).is_err()
        );
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&[(
                "GUARDIAN_ICE_SERVERS",
                r#"[{"id":"t","type":"turn","url":"turn.example.org"}]"#
            )])),
            Err(ConfigError::TurnCredentialsMissing(_))
        ));
    }
}
