//! Control-channel messages
//!
//! JSON objects tagged by a `type` field. The SDP blobs and candidate
//! strings are opaque to both the service and the session controller.

use serde::{Deserialize, Serialize};

use duet_core::IceCandidate;

/// Messages exchanged over the rendezvous control connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Creator registers a single-peer room with its offer
    Create { name: String, sdp: String },

    /// Creator registers a hub room accepting many joiners
    CreateMulti { name: String, key: String },

    /// Room registered
    Created {
        name: String,
        #[serde(default, skip_serializing_if = "is_false")]
        multi: bool,
    },

    /// Joiner looks a room up
    Join { name: String },

    /// Offer for a joiner (also used for restart renegotiation)
    Offer {
        name: String,
        sdp: String,
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },

    /// No creator showed up within the join wait
    NotFound { name: String },

    /// A joiner arrived at a hub room
    JoinRequest {
        name: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Answer to an offer
    Answer {
        name: String,
        sdp: String,
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },

    /// A hub joiner's control connection closed
    PeerLeft {
        name: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Acknowledges a relayed answer
    #[serde(rename = "ok")]
    Ack,

    /// Trickled ICE candidate
    Candidate {
        name: String,
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: Option<u16>,
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },

    /// Error response
    Error { error: String },
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Wire error codes carried in `error{error}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A pending room already uses this name
    RoomExists,
    /// No pending room with this name
    RoomNotFound,
    /// The room was never answered within its TTL
    RoomExpired,
    /// Malformed JSON or unknown `type`
    InvalidMessage,
    /// A server-to-client message was sent to the server
    UnexpectedMessage,
    /// Relay requested from a connection with no partner
    NotPaired,
    /// Hub routing key does not name a live joiner
    UnknownPeer,
    /// Hub key rejected
    InvalidKey,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RoomExists => "room_exists",
            ErrorCode::RoomNotFound => "room_not_found",
            ErrorCode::RoomExpired => "room_expired",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::UnexpectedMessage => "unexpected_message",
            ErrorCode::NotPaired => "not_paired",
            ErrorCode::UnknownPeer => "unknown_peer",
            ErrorCode::InvalidKey => "invalid_key",
        }
    }
}

impl ControlMessage {
    /// Create an error message
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            error: code.as_str().to_string(),
        }
    }

    /// Wrap a local candidate for relay
    pub fn candidate(name: &str, candidate: IceCandidate, peer_id: Option<String>) -> Self {
        Self::Candidate {
            name: name.to_string(),
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            peer_id,
        }
    }

    /// Room name the message refers to, if any
    pub fn room_name(&self) -> Option<&str> {
        match self {
            Self::Create { name, .. }
            | Self::CreateMulti { name, .. }
            | Self::Created { name, .. }
            | Self::Join { name }
            | Self::Offer { name, .. }
            | Self::NotFound { name }
            | Self::JoinRequest { name, .. }
            | Self::PeerLeft { name, .. }
            | Self::Answer { name, .. }
            | Self::Candidate { name, .. } => Some(name),
            Self::Ack | Self::Error { .. } => None,
        }
    }

    /// Hub routing key, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Offer { peer_id, .. }
            | Self::Answer { peer_id, .. }
            | Self::Candidate { peer_id, .. } => peer_id.as_deref(),
            Self::JoinRequest { peer_id, .. } | Self::PeerLeft { peer_id, .. } => Some(peer_id),
            _ => None,
        }
    }

    /// Copy of this message with its hub routing key replaced
    pub fn with_peer_id(&self, id: Option<String>) -> Self {
        let mut msg = self.clone();
        match &mut msg {
            Self::Offer { peer_id, .. }
            | Self::Answer { peer_id, .. }
            | Self::Candidate { peer_id, .. } => *peer_id = id,
            _ => {}
        }
        msg
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::CreateMulti { .. } => "create_multi",
            Self::Created { .. } => "created",
            Self::Join { .. } => "join",
            Self::Offer { .. } => "offer",
            Self::NotFound { .. } => "not_found",
            Self::JoinRequest { .. } => "join_request",
            Self::PeerLeft { .. } => "peer_left",
            Self::Answer { .. } => "answer",
            Self::Ack => "ok",
            Self::Candidate { .. } => "candidate",
            Self::Error { .. } => "error",
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn to_value(msg: &ControlMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_create_wire_format() {
        let msg = ControlMessage::Create {
            name: "blue-otter".into(),
            sdp: "v=0...".into(),
        };
        assert_eq!(
            to_value(&msg),
            json!({"type": "create", "name": "blue-otter", "sdp": "v=0..."})
        );
    }

    #[test]
    fn test_created_multi_flag() {
        let single = ControlMessage::Created {
            name: "x".into(),
            multi: false,
        };
        assert_eq!(to_value(&single), json!({"type": "created", "name": "x"}));

        let multi = ControlMessage::Created {
            name: "x".into(),
            multi: true,
        };
        assert_eq!(
            to_value(&multi),
            json!({"type": "created", "name": "x", "multi": true})
        );
    }

    #[test]
    fn test_candidate_field_names() {
        let msg = ControlMessage::from_json(
            r#"{"type":"candidate","name":"x","candidate":"candidate:1 1 udp ...","sdpMid":"0","sdpMLineIndex":0,"peerId":"ab"}"#,
        )
        .unwrap();
        assert_eq!(msg.peer_id(), Some("ab"));
        match &msg {
            ControlMessage::Candidate {
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                assert_eq!(sdp_mid.as_deref(), Some("0"));
                assert_eq!(*sdp_mline_index, Some(0));
            }
            _ => panic!("wrong message type"),
        }

        let stripped = to_value(&msg.with_peer_id(None));
        assert!(stripped.get("peerId").is_none());
        assert_eq!(stripped["sdpMLineIndex"], json!(0));
    }

    #[test]
    fn test_ok_and_error() {
        assert_eq!(to_value(&ControlMessage::Ack), json!({"type": "ok"}));
        assert_eq!(
            ControlMessage::from_json(r#"{"type":"ok"}"#).unwrap(),
            ControlMessage::Ack
        );
        assert_eq!(
            to_value(&ControlMessage::error(ErrorCode::RoomExists)),
            json!({"type": "error", "error": "room_exists"})
        );
    }

    #[test]
    fn test_join_request_peer_id() {
        let msg = ControlMessage::JoinRequest {
            name: "hub".into(),
            peer_id: "0011".into(),
        };
        assert_eq!(
            to_value(&msg),
            json!({"type": "join_request", "name": "hub", "peerId": "0011"})
        );

        let left = ControlMessage::from_json(r#"{"type":"peer_left","name":"hub","peerId":"0011"}"#)
            .unwrap();
        assert_eq!(left.peer_id(), Some("0011"));
        assert_eq!(left.kind(), "peer_left");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ControlMessage::from_json(r#"{"type":"rename","name":"x"}"#).is_err());
        assert!(ControlMessage::from_json(r#"{"name":"x"}"#).is_err());
        assert!(ControlMessage::from_json("not json").is_err());
    }
}
