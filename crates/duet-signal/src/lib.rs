//! Duet Signal Server
//!
//! Rendezvous service that pairs a room creator with a joiner and relays
//! the negotiation blobs between them. Clients connect via WebSocket and
//! exchange JSON control messages.
//!
//! # Protocol
//!
//! 1. Creator registers a room name together with its offer
//! 2. Joiner looks the name up and receives the offer
//! 3. Joiner's answer is relayed to the creator and the room is released
//! 4. Candidates and restart offers keep flowing between the paired connections
//! 5. Hub rooms stay registered and route by per-joiner peer id

pub mod messages;
pub mod registry;
pub mod room;
pub mod server;

pub use messages::{ControlMessage, ErrorCode};
pub use registry::{Outbound, Registry};
pub use room::{Room, RoomMode};
pub use server::SignalServer;

/// Server-assigned id of a control connection
pub type ConnId = u64;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = duet_core::DEFAULT_SIGNAL_PORT;
