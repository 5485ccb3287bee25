use crate::peer::state::InvalidTransition;
use thiserror::Error;

/// Platform refused or could not provide capture devices.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission to capture media was denied")]
    PermissionDenied,

    #[error("media capture aborted: {0}")]
    Aborted(String),
}

/// Errors from the relay connection (identity assignment and signaling).
#[derive(Debug, Error)]
pub enum RelayError {
    /// No open relay connection for an operation that needs one.
    #[error("signaling relay unavailable")]
    Unavailable,

    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("relay connect failed: {0}")]
    Connect(String),

    #[error("relay http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay frame error: {0}")]
    Frame(#[from] serde_json::Error),

    /// Error reported by the relay itself (`ERROR`, `ID-TAKEN`, `INVALID-KEY`).
    #[error("relay rejected request: {0}")]
    Server(String),

    #[error("relay connection closed")]
    Closed,
}

/// Errors while turning SDP + local media into a peer connection.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    #[error("local description missing after negotiation")]
    MissingLocalDescription,

    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
}

/// Errors from mutating a call session.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A second local stream was offered to a session that already owns one.
    #[error("session {0} already owns a local stream")]
    StreamAlreadyAttached(String),
}

/// Configuration problems (bad env values, invalid ICE servers).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("ICE server {0}: url cannot be empty")]
    EmptyIceUrl(String),

    #[error("ICE server {0}: TURN servers require username and credential")]
    TurnCredentialsMissing(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_errors_render_their_cause() {
        let err = CallError::from(InvalidTransition {
            current_state: "Ended".into(),
            attempted: "AttachLocal".into(),
        });
        assert_eq!(
            err.to_string(),
            "invalid transition AttachLocal in state Ended"
        );

        let err = CallError::StreamAlreadyAttached("mc_1".into());
        assert_eq!(err.to_string(), "session mc_1 already owns a local stream");
        assert_eq!(
            MediaAccessError::PermissionDenied.to_string(),
            "permission to capture media was denied"
        );
    }
}
