//! Relay wire format (PeerJS-compatible JSON frames).

use crate::peer::types::{ConnectionId, IceCandidate, SessionDescription, SignalingIdentity};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Media,
    Data,
}

/// OFFER / ANSWER payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl SdpPayload {
    pub fn media(connection_id: ConnectionId, sdp: SessionDescription) -> Self {
        Self {
            sdp,
            connection_type: ConnectionType::Media,
            connection_id,
            metadata: None,
            browser: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: ConnectionId,
}

/// LEAVE payload naming the one call being ended. A LEAVE without it
/// means the sender is gone entirely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub connection_id: ConnectionId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub msg: String,
}

// ========== FRAMES ==========

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RelayMessage {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "OFFER")]
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<SignalingIdentity>,
        payload: SdpPayload,
    },
    #[serde(rename = "ANSWER")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<SignalingIdentity>,
        payload: SdpPayload,
    },
    #[serde(rename = "CANDIDATE")]
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<SignalingIdentity>,
        payload: CandidatePayload,
    },
    #[serde(rename = "LEAVE")]
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<LeavePayload>,
    },
    /// The relay could not deliver to `src` (it is gone).
    #[serde(rename = "EXPIRE")]
    Expire {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<SignalingIdentity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<SignalingIdentity>,
    },
    #[serde(rename = "ERROR")]
    Error { payload: ErrorPayload },
    #[serde(rename = "ID-TAKEN")]
    IdTaken {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<ErrorPayload>,
    },
    #[serde(rename = "INVALID-KEY")]
    InvalidKey {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<ErrorPayload>,
    },
}

impl RelayMessage {
    pub fn offer(dst: SignalingIdentity, payload: SdpPayload) -> Self {
        RelayMessage::Offer {
            src: None,
            dst: Some(dst),
            payload,
        }
    }

    pub fn answer(dst: SignalingIdentity, payload: SdpPayload) -> Self {
        RelayMessage::Answer {
            src: None,
            dst: Some(dst),
            payload,
        }
    }

    pub fn candidate(
        dst: SignalingIdentity,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    ) -> Self {
        RelayMessage::Candidate {
            src: None,
            dst: Some(dst),
            payload: CandidatePayload {
                candidate,
                connection_type: ConnectionType::Media,
                connection_id,
            },
        }
    }

    /// Tells `dst` that we are leaving altogether.
    pub fn leave(dst: SignalingIdentity) -> Self {
        RelayMessage::Leave {
            src: None,
            dst: Some(dst),
            payload: None,
        }
    }

    /// Ends one call with `dst`; other calls with the same peer stay up.
    pub fn leave_call(dst: SignalingIdentity, connection_id: ConnectionId) -> Self {
        RelayMessage::Leave {
            src: None,
            dst: Some(dst),
            payload: Some(LeavePayload {
                connection_type: ConnectionType::Media,
                connection_id,
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Open => "OPEN",
            RelayMessage::Heartbeat => "HEARTBEAT",
            RelayMessage::Offer { .. } => "OFFER",
            RelayMessage::Answer { .. } => "ANSWER",
            RelayMessage::Candidate { .. } => "CANDIDATE",
            RelayMessage::Leave { .. } => "LEAVE",
            RelayMessage::Expire { .. } => "EXPIRE",
            RelayMessage::Error { .. } => "ERROR",
            RelayMessage::IdTaken { .. } => "ID-TAKEN",
            RelayMessage::InvalidKey { .. } => "INVALID-KEY",
        }
    }

    pub fn src(&self) -> Option<&SignalingIdentity> {
        match self {
            RelayMessage::Offer { src, .. }
            | RelayMessage::Answer { src, .. }
            | RelayMessage::Candidate { src, .. }
            | RelayMessage::Leave { src, .. }
            | RelayMessage::Expire { src, .. } => src.as_ref(),
            _ => None,
        }
    }

    pub fn dst(&self) -> Option<&SignalingIdentity> {
        match self {
            RelayMessage::Offer { dst, .. }
            | RelayMessage::Answer { dst, .. }
            | RelayMessage::Candidate { dst, .. }
            | RelayMessage::Leave { dst, .. }
            | RelayMessage::Expire { dst, .. } => dst.as_ref(),
            _ => None,
        }
    }

    /// Stamps the sender; the relay does this before forwarding.
    pub fn with_src(mut self, from: SignalingIdentity) -> Self {
        match &mut self {
            RelayMessage::Offer { src, .. }
            | RelayMessage::Answer { src, .. }
            | RelayMessage::Candidate { src, .. }
            | RelayMessage::Leave { src, .. }
            | RelayMessage::Expire { src, .. } => *src = Some(from),
            _ => {}
        }
        self
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_matches_peerjs_shape() {
        let msg = RelayMessage::offer(
            SignalingIdentity::from("xyz789"),
            SdpPayload::media(ConnectionId::from("mc_1"), SessionDescription::offer("v=0")),
        );
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "OFFER",
                "dst": "xyz789",
                "payload": {
                    "sdp": { "type": "offer", "sdp": "v=0" },
                    "type": "media",
                    "connectionId": "mc_1"
                }
            })
        );
    }

    #[test]
    fn decodes_relay_forwarded_candidate() {
        let text = r#"{
            "type": "CANDIDATE",
            "src": "abc123",
            "dst": "xyz789",
            "payload": {
                "candidate": {
                    "candidate": "candidate:0 1 UDP 2122252543 192.168.1.5 54321 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0,
                    "usernameFragment": "f00d"
                },
                "type": "media",
                "connectionId": "mc_abc"
            }
        }"#;
        let msg = RelayMessage::decode(text).unwrap();
        assert_eq!(msg.src().map(|s| s.as_str()), Some("abc123"));
        match msg {
            RelayMessage::Candidate { payload, .. } => {
                assert_eq!(payload.connection_id.as_str(), "mc_abc");
                assert_eq!(payload.candidate.sdp_mline_index, Some(0));
                assert_eq!(payload.candidate.username_fragment.as_deref(), Some("f00d"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn control_frames_decode() {
        assert_eq!(RelayMessage::decode(r#"{"type":"OPEN"}"#).unwrap(), RelayMessage::Open);
        assert_eq!(
            RelayMessage::Heartbeat.encode().unwrap(),
            r#"{"type":"HEARTBEAT"}"#
        );
        let err = RelayMessage::decode(r#"{"type":"ERROR","payload":{"msg":"Invalid key"}}"#)
            .unwrap();
        assert_eq!(err.kind(), "ERROR");
        let taken = RelayMessage::decode(
            r#"{"type":"ID-TAKEN","payload":{"msg":"ID is taken"}}"#,
        )
        .unwrap();
        assert!(matches!(taken, RelayMessage::IdTaken { payload: Some(_) }));
    }

    #[test]
    fn call_scoped_leave_names_the_connection() {
        let msg = RelayMessage::leave_call(
            SignalingIdentity::from("xyz789"),
            ConnectionId::from("mc_2"),
        );
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "LEAVE",
                "dst": "xyz789",
                "payload": { "type": "media", "connectionId": "mc_2" }
            })
        );

        let bare = RelayMessage::decode(r#"{"type":"LEAVE","src":"abc123"}"#).unwrap();
        assert!(matches!(bare, RelayMessage::Leave { payload: None, .. }));
    }

    #[test]
    fn relay_stamps_source() {
        let msg = RelayMessage::leave(SignalingIdentity::from("xyz789"))
            .with_src(SignalingIdentity::from("abc123"));
        assert_eq!(msg.src().map(|s| s.as_str()), Some("abc123"));
        assert_eq!(msg.dst().map(|s| s.as_str()), Some("xyz789"));
    }
}
