//! Duet Peer - Session side of a duet connection
//!
//! This crate provides:
//! - The transport capability ([`Transport`]) and its WebRTC backend
//! - The rendezvous client that keeps the control connection alive
//! - The session lifecycle state machine and its async driver
//! - Hub mode, one creator serving many joiners

pub mod hub;
pub mod machine;
pub mod rendezvous;
pub mod session;
pub mod transport;
pub mod webrtc;

pub use hub::{Hub, HubEvent, HubHandle};
pub use machine::{Effect, Input, Phase, SessionEvent, SessionMachine, Timer};
pub use rendezvous::{RendezvousClient, RendezvousError, SignalCommand, SignalEvent, SignalLink};
pub use session::{Session, SessionHandle};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use webrtc::{WebRtcFactory, WebRtcTransport};
