//! Duet Core - Shared types, configuration and data-channel framing
//!
//! This crate contains the foundational types used by both the peer and the
//! rendezvous service. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod frame;
pub mod types;

pub use config::{Config, RendezvousConfig, SessionConfig, SignalConfig, TransportConfig};
pub use error::*;
pub use frame::{DataFrame, Payload};
pub use types::*;

/// Default rendezvous service port
pub const DEFAULT_SIGNAL_PORT: u16 = 8080;

/// Maximum accepted control message size (64 KB)
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;
