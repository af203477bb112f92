//! Secure peer transport capability
//!
//! The session controller never looks inside an offer or answer. It drives
//! the transport through [`Transport`] and learns about progress through
//! [`TransportEvent`]s delivered on a channel, so a backend can report state
//! changes from its own callbacks without calling back into the controller.

use async_trait::async_trait;
use tokio::sync::mpsc;

use duet_core::{IceCandidate, Role, TransportError, TransportState};

use crate::machine::Input;

/// Notifications emitted by a transport backend
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Peer connection state changed
    ConnectionState(TransportState),
    /// ICE connection state changed
    IceState(TransportState),
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// The data channel opened
    ChannelOpen,
    /// Text arrived on the data channel
    ChannelMessage(String),
    /// The data channel closed
    ChannelClosed,
    /// The data channel reported an error
    ChannelError(String),
}

impl From<TransportEvent> for Input {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::ConnectionState(state) => Input::ConnectionState(state),
            TransportEvent::IceState(state) => Input::IceState(state),
            TransportEvent::LocalCandidate(candidate) => Input::LocalCandidate(candidate),
            TransportEvent::ChannelOpen => Input::ChannelOpen,
            TransportEvent::ChannelMessage(text) => Input::ChannelMessage(text),
            TransportEvent::ChannelClosed => Input::ChannelClosed,
            TransportEvent::ChannelError(e) => Input::ChannelError(e),
        }
    }
}

/// Sender half handed to a transport backend
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiver half consumed by the session driver
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// One secure peer connection with a single text data channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Create a local offer and apply it as the local description
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError>;

    /// Apply a remote offer, then create and apply the local answer
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    /// Apply a remote answer to our outstanding offer
    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError>;

    /// Add a trickled remote candidate
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Send text on the data channel
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Whether the data channel exists and is open
    fn channel_open(&self) -> bool;

    /// Release the connection and its data channel
    async fn close(&self);
}

/// Builds transports for new sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `role`, reporting progress on `events`
    async fn create(
        &self,
        role: Role,
        events: EventSender,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Scripted in-memory transport for driver tests
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Calls observed by the mock
    #[derive(Clone, Debug, PartialEq)]
    pub enum Call {
        CreateOffer { ice_restart: bool },
        AcceptOffer(String),
        AcceptAnswer(String),
        AddCandidate(String),
        Send(String),
        Close,
    }

    #[derive(Default)]
    pub struct MockState {
        pub calls: Mutex<Vec<Call>>,
        pub channel_open: AtomicBool,
        pub offers: AtomicU32,
    }

    impl MockState {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub fn sent(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Send(text) => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    pub struct MockTransport {
        pub state: Arc<MockState>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
            self.state.calls.lock().push(Call::CreateOffer { ice_restart });
            let n = self.state.offers.fetch_add(1, Ordering::SeqCst);
            Ok(format!("offer-{}", n))
        }

        async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
            self.state.calls.lock().push(Call::AcceptOffer(sdp.clone()));
            Ok(format!("answer-to-{}", sdp))
        }

        async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
            self.state.calls.lock().push(Call::AcceptAnswer(sdp));
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            candidate: IceCandidate,
        ) -> Result<(), TransportError> {
            self.state
                .calls
                .lock()
                .push(Call::AddCandidate(candidate.candidate));
            Ok(())
        }

        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            if !self.channel_open() {
                return Err(TransportError::ChannelNotOpen);
            }
            self.state.calls.lock().push(Call::Send(text.to_string()));
            Ok(())
        }

        fn channel_open(&self) -> bool {
            self.state.channel_open.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.state.channel_open.store(false, Ordering::SeqCst);
            self.state.calls.lock().push(Call::Close);
        }
    }

    /// Hands out mock transports and keeps their event senders
    #[derive(Default)]
    pub struct MockFactory {
        pub created: Mutex<Vec<(Arc<MockState>, EventSender)>>,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn create(
            &self,
            _role: Role,
            events: EventSender,
        ) -> Result<Box<dyn Transport>, TransportError> {
            let state = Arc::new(MockState::default());
            self.created.lock().push((state.clone(), events));
            Ok(Box::new(MockTransport { state }))
        }
    }
}
