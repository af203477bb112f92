//! Room model for the rendezvous service

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::messages::ControlMessage;
use crate::ConnId;

/// A named rendezvous point owned by one creator connection
#[derive(Debug)]
pub struct Room {
    /// Room name, unique among live rooms
    pub name: String,

    /// Control connection of the creator
    pub owner: ConnId,

    /// Single-peer or hub bookkeeping
    pub mode: RoomMode,

    /// When the room was registered
    pub created_at: Instant,

    /// Unanswered single-peer rooms are deleted after this long
    pub ttl: Duration,
}

/// Per-mode room state
#[derive(Debug)]
pub enum RoomMode {
    /// One creator, one joiner
    Single {
        /// The creator's offer, handed to every joiner
        offer: String,
        /// Creator candidates trickled before a joiner showed up
        candidates: Vec<ControlMessage>,
        /// Joiner connections that already received the offer
        offered: Vec<ConnId>,
    },
    /// One creator, many joiners keyed by ephemeral peer id
    Hub { peers: HashMap<String, HubPeer> },
}

/// A joiner attached to a hub room
#[derive(Debug, Clone)]
pub struct HubPeer {
    /// The joiner's control connection
    pub conn: ConnId,
    /// Last offer the hub produced for this joiner
    pub offer: Option<String>,
}

impl Room {
    /// Create a single-peer room
    pub fn single(name: String, owner: ConnId, offer: String, ttl: Duration, now: Instant) -> Self {
        Self {
            name,
            owner,
            mode: RoomMode::Single {
                offer,
                candidates: Vec::new(),
                offered: Vec::new(),
            },
            created_at: now,
            ttl,
        }
    }

    /// Create a hub room
    pub fn hub(name: String, owner: ConnId, now: Instant) -> Self {
        Self {
            name,
            owner,
            mode: RoomMode::Hub {
                peers: HashMap::new(),
            },
            created_at: now,
            ttl: Duration::MAX,
        }
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.mode, RoomMode::Hub { .. })
    }

    /// When an unanswered room expires. Hub rooms never do.
    pub fn expires_at(&self) -> Option<Instant> {
        if self.is_hub() {
            return None;
        }
        self.created_at.checked_add(self.ttl)
    }

    /// Check if the room has outlived its TTL
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Find the hub peer id attached to a joiner connection
    pub fn hub_peer_for(&self, conn: ConnId) -> Option<&str> {
        match &self.mode {
            RoomMode::Hub { peers } => peers
                .iter()
                .find(|(_, peer)| peer.conn == conn)
                .map(|(id, _)| id.as_str()),
            RoomMode::Single { .. } => None,
        }
    }
}
