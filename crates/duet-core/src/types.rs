//! Core types shared by the peer and the rendezvous service

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the handshake a session plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Registers the room and produces the initial offer. Opens the data channel.
    Creator,
    /// Looks the room up, answers the offer and receives the data channel.
    Joiner,
}

impl Role {
    /// Whether this side creates the data channel locally
    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Creator)
    }
}

/// Connection status of the secure peer transport.
///
/// Mirrors both the peer-connection state and the ICE connection state
/// reported by the transport backend; the controller treats them alike.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Gathering,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Connected or completed
    pub fn is_up(self) -> bool {
        matches!(self, TransportState::Connected | TransportState::Completed)
    }

    /// Disconnected or failed, both of which may still recover after a restart
    pub fn is_degraded(self) -> bool {
        matches!(self, TransportState::Disconnected | TransportState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Gathering => "gathering",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Completed => "completed",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trickled ICE candidate, relayed opaquely between peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}
