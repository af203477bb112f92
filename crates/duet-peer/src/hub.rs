//! Hub mode: one creator, many joiners
//!
//! A hub registers its room with `create_multi` and keeps a single control
//! connection. Every `join_request` gets its own transport and its own
//! [`SessionMachine`] spoke, addressed by the peer id the service assigned.
//! Control messages carrying a peer id are routed to that spoke; spokes'
//! outgoing messages are funnelled back into the shared connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use duet_core::{Config, Role, SessionConfig};
use duet_signal::ControlMessage;

use crate::machine::{SessionEvent, SessionMachine};
use crate::rendezvous::{RendezvousClient, SignalCommand, SignalEvent, SignalLink};
use crate::session::{Session, SessionHandle};
use crate::transport::TransportFactory;
use crate::webrtc::WebRtcFactory;

/// Hub notifications for the user interface
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// Event from one spoke
    Peer { peer_id: String, event: SessionEvent },
    /// Hub-level status line
    Status(String),
    /// Hub stopped
    Closed,
}

enum HubCommand {
    Broadcast(String, oneshot::Sender<usize>),
    SendTo(String, String, oneshot::Sender<bool>),
    Close,
}

/// Cloneable handle to a running hub
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Send to every peer with an open channel; returns how many accepted it
    pub async fn broadcast(&self, text: impl Into<String>) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(HubCommand::Broadcast(text.into(), tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Send to one peer
    pub async fn send_to(&self, peer_id: &str, text: impl Into<String>) -> bool {
        let (tx, rx) = oneshot::channel();
        let cmd = HubCommand::SendTo(peer_id.to_string(), text.into(), tx);
        if self.commands.send(cmd).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn close(&self) {
        let _ = self.commands.send(HubCommand::Close);
    }
}

/// A running hub
pub struct Hub {
    pub handle: HubHandle,
    pub events: mpsc::UnboundedReceiver<HubEvent>,
    pub task: JoinHandle<()>,
}

impl Hub {
    /// Start a hub against the configured signal server over WebRTC
    pub fn start(name: &str, key: &str, config: &Config) -> Self {
        let factory = Arc::new(WebRtcFactory::new(config.transport.clone()));
        let (link, _client) = RendezvousClient::new(config.rendezvous.clone()).spawn();
        Self::spawn(name, key, config.session.clone(), factory, link)
    }

    pub fn spawn(
        name: &str,
        key: &str,
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        link: SignalLink,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let state = HubState {
            name: name.to_string(),
            key: key.to_string(),
            config,
            factory,
            signal: link.commands,
            peers: HashMap::new(),
            out: out_tx,
            peer_events: peer_tx,
        };
        let task = tokio::spawn(state.run(link.events, peer_rx, cmd_rx));

        Self {
            handle: HubHandle { commands: cmd_tx },
            events: out_rx,
            task,
        }
    }
}

struct Spoke {
    handle: SessionHandle,
    signal_in: mpsc::UnboundedSender<SignalEvent>,
    opened: bool,
}

struct HubState {
    name: String,
    key: String,
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    signal: mpsc::UnboundedSender<SignalCommand>,
    peers: HashMap<String, Spoke>,
    out: mpsc::UnboundedSender<HubEvent>,
    peer_events: mpsc::UnboundedSender<(String, SessionEvent)>,
}

impl HubState {
    async fn run(
        mut self,
        mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        mut peer_events: mpsc::UnboundedReceiver<(String, SessionEvent)>,
        mut commands: mpsc::UnboundedReceiver<HubCommand>,
    ) {
        let mut signal_alive = true;

        loop {
            tokio::select! {
                event = signal_events.recv(), if signal_alive => match event {
                    Some(SignalEvent::Open) => {
                        info!("Hub {} registering", self.name);
                        self.signal_send(ControlMessage::CreateMulti {
                            name: self.name.clone(),
                            key: self.key.clone(),
                        });
                    }
                    Some(SignalEvent::Message(msg)) => {
                        if !self.route(msg).await {
                            break;
                        }
                    }
                    Some(SignalEvent::Closed) => {
                        self.status("rendezvous connection lost, reconnecting");
                        self.drop_pending_peers();
                    }
                    None => signal_alive = false,
                },
                Some((peer_id, event)) = peer_events.recv() => self.on_peer_event(peer_id, event),
                cmd = commands.recv() => match cmd {
                    Some(HubCommand::Broadcast(text, reply)) => {
                        let mut delivered = 0;
                        for spoke in self.peers.values().filter(|s| s.opened) {
                            if spoke.handle.send(text.clone()).await {
                                delivered += 1;
                            }
                        }
                        let _ = reply.send(delivered);
                    }
                    Some(HubCommand::SendTo(peer_id, text, reply)) => {
                        let sent = match self.peers.get(&peer_id) {
                            Some(spoke) => spoke.handle.send(text).await,
                            None => false,
                        };
                        let _ = reply.send(sent);
                    }
                    Some(HubCommand::Close) | None => break,
                },
            }
        }

        for spoke in self.peers.values() {
            spoke.handle.close();
        }
        let _ = self.signal.send(SignalCommand::Close);
        let _ = self.out.send(HubEvent::Closed);
        info!("Hub {} closed", self.name);
    }

    /// Route one control message. `false` stops the hub.
    async fn route(&mut self, msg: ControlMessage) -> bool {
        match msg {
            ControlMessage::Created { multi: true, .. } => {
                self.status(format!("hub {} ready for peers", self.name));
            }
            ControlMessage::JoinRequest { peer_id, .. } => self.spawn_peer(peer_id).await,
            ControlMessage::Error { error } => match error.as_str() {
                "invalid_key" | "room_exists" => {
                    warn!("Hub {} rejected: {}", self.name, error);
                    self.status(format!("hub rejected: {}", error));
                    return false;
                }
                _ => self.status(format!("rendezvous error: {}", error)),
            },
            ControlMessage::Ack => {}
            msg => match msg.peer_id().map(str::to_string) {
                Some(peer_id) => match self.peers.get(&peer_id) {
                    Some(spoke) => {
                        let _ = spoke.signal_in.send(SignalEvent::Message(msg));
                    }
                    None => debug!("Dropping {} for unknown peer {}", msg.kind(), peer_id),
                },
                None => debug!("Hub ignoring {}", msg.kind()),
            },
        }
        true
    }

    async fn spawn_peer(&mut self, peer_id: String) {
        if self.peers.contains_key(&peer_id) {
            return;
        }
        info!("Hub {} accepting peer {}", self.name, peer_id);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = match self.factory.create(Role::Creator, transport_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Transport for peer {} failed: {}", peer_id, e);
                self.status(format!("could not accept peer {}: {}", peer_id, e));
                return;
            }
        };

        let (link, mut spoke_commands, signal_in) = SignalLink::pair();
        let machine = SessionMachine::hub_peer(&self.name, peer_id.clone(), self.config.clone());
        let Session {
            handle, mut events, ..
        } = Session::spawn(machine, transport, transport_rx, link);

        // Only control messages reach the shared connection; a spoke's
        // handshake-done or close must not affect its siblings
        let shared = self.signal.clone();
        tokio::spawn(async move {
            while let Some(cmd) = spoke_commands.recv().await {
                if let SignalCommand::Send(msg) = cmd {
                    let _ = shared.send(SignalCommand::Send(msg));
                }
            }
        });

        let tagged = self.peer_events.clone();
        let id = peer_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tagged.send((id.clone(), event)).is_err() {
                    break;
                }
            }
        });

        let _ = signal_in.send(SignalEvent::Open);
        self.peers.insert(
            peer_id,
            Spoke {
                handle,
                signal_in,
                opened: false,
            },
        );
    }

    fn on_peer_event(&mut self, peer_id: String, event: SessionEvent) {
        match &event {
            SessionEvent::Open => {
                if let Some(spoke) = self.peers.get_mut(&peer_id) {
                    spoke.opened = true;
                }
            }
            SessionEvent::Close => {
                self.peers.remove(&peer_id);
                debug!("Hub {} dropped peer {}", self.name, peer_id);
            }
            _ => {}
        }
        let _ = self.out.send(HubEvent::Peer { peer_id, event });
    }

    /// Spokes mid-handshake cannot finish once the room registration is gone
    fn drop_pending_peers(&mut self) {
        for spoke in self.peers.values().filter(|s| !s.opened) {
            spoke.handle.close();
        }
    }

    fn signal_send(&self, msg: ControlMessage) {
        if self.signal.send(SignalCommand::Send(msg)).is_err() {
            debug!("Hub signal link gone");
        }
    }

    fn status(&self, text: impl Into<String>) {
        let _ = self.out.send(HubEvent::Status(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use duet_core::TransportState;

    use crate::transport::mock::{Call, MockFactory};
    use crate::transport::TransportEvent;

    struct Harness {
        hub: Hub,
        factory: Arc<MockFactory>,
        signal_in: mpsc::UnboundedSender<SignalEvent>,
        signal_out: mpsc::UnboundedReceiver<SignalCommand>,
    }

    fn harness() -> Harness {
        let factory = Arc::new(MockFactory::default());
        let (link, signal_out, signal_in) = SignalLink::pair();
        let hub = Hub::spawn(
            "lobby",
            "secret",
            SessionConfig::default(),
            factory.clone(),
            link,
        );
        Harness {
            hub,
            factory,
            signal_in,
            signal_out,
        }
    }

    async fn next_signal(h: &mut Harness) -> SignalCommand {
        tokio::time::timeout(Duration::from_secs(5), h.signal_out.recv())
            .await
            .expect("signal in time")
            .expect("hub running")
    }

    async fn wait_for(h: &mut Harness, pred: impl Fn(&HubEvent) -> bool) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), h.hub.events.recv())
                .await
                .expect("event in time")
                .expect("hub running");
            if pred(&event) {
                return;
            }
        }
    }

    fn deliver(h: &Harness, msg: ControlMessage) {
        h.signal_in.send(SignalEvent::Message(msg)).unwrap();
    }

    fn join_request(peer_id: &str) -> ControlMessage {
        ControlMessage::JoinRequest {
            name: "lobby".into(),
            peer_id: peer_id.into(),
        }
    }

    #[tokio::test]
    async fn test_hub_registers_on_open() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        assert_eq!(
            next_signal(&mut h).await,
            SignalCommand::Send(ControlMessage::CreateMulti {
                name: "lobby".into(),
                key: "secret".into()
            })
        );

        deliver(
            &h,
            ControlMessage::Created {
                name: "lobby".into(),
                multi: true,
            },
        );
        wait_for(&mut h, |e| matches!(e, HubEvent::Status(s) if s.contains("ready"))).await;
    }

    #[tokio::test]
    async fn test_join_requests_get_independent_offers() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        next_signal(&mut h).await;

        deliver(&h, join_request("p1"));
        assert_eq!(
            next_signal(&mut h).await,
            SignalCommand::Send(ControlMessage::Offer {
                name: "lobby".into(),
                sdp: "offer-0".into(),
                peer_id: Some("p1".into())
            })
        );

        deliver(&h, join_request("p2"));
        assert_eq!(
            next_signal(&mut h).await,
            SignalCommand::Send(ControlMessage::Offer {
                name: "lobby".into(),
                sdp: "offer-0".into(),
                peer_id: Some("p2".into())
            })
        );
        assert_eq!(h.factory.created.lock().len(), 2);

        // Answer routed to p2 only
        deliver(
            &h,
            ControlMessage::Answer {
                name: "lobby".into(),
                sdp: "from-p2".into(),
                peer_id: Some("p2".into()),
            },
        );
        wait_for(&mut h, |e| {
            matches!(e, HubEvent::Peer { peer_id, event: SessionEvent::Status(s) }
                if peer_id == "p2" && s.contains("peer found"))
        })
        .await;

        let created = h.factory.created.lock();
        assert!(created[1]
            .0
            .calls()
            .contains(&Call::AcceptAnswer("from-p2".into())));
        assert!(!created[0]
            .0
            .calls()
            .iter()
            .any(|c| matches!(c, Call::AcceptAnswer(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_open_peers() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        next_signal(&mut h).await;
        deliver(&h, join_request("p1"));
        next_signal(&mut h).await;
        deliver(&h, join_request("p2"));
        next_signal(&mut h).await;

        let (state, events) = h.factory.created.lock()[0].clone();
        state.channel_open.store(true, Ordering::SeqCst);
        events
            .send(TransportEvent::ConnectionState(TransportState::Connected))
            .unwrap();
        events.send(TransportEvent::ChannelOpen).unwrap();
        wait_for(&mut h, |e| {
            matches!(e, HubEvent::Peer { peer_id, event: SessionEvent::Open } if peer_id == "p1")
        })
        .await;

        assert_eq!(h.hub.handle.broadcast("hello all").await, 1);
        assert!(state.sent().contains(&"hello all".to_string()));
        assert!(h.hub.handle.send_to("p1", "just you").await);
        assert!(!h.hub.handle.send_to("p2", "not open").await);
        assert!(!h.hub.handle.send_to("nobody", "x").await);
    }

    #[tokio::test]
    async fn test_rejected_key_stops_hub() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        next_signal(&mut h).await;

        deliver(
            &h,
            ControlMessage::Error {
                error: "invalid_key".into(),
            },
        );
        wait_for(&mut h, |e| *e == HubEvent::Closed).await;
        assert_eq!(next_signal(&mut h).await, SignalCommand::Close);
    }

    #[tokio::test]
    async fn test_peer_left_drops_pending_spoke() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        next_signal(&mut h).await;
        deliver(&h, join_request("p1"));
        next_signal(&mut h).await;
        deliver(&h, join_request("p2"));
        next_signal(&mut h).await;

        deliver(
            &h,
            ControlMessage::PeerLeft {
                name: "lobby".into(),
                peer_id: "p1".into(),
            },
        );
        wait_for(&mut h, |e| {
            matches!(e, HubEvent::Peer { peer_id, event: SessionEvent::Close } if peer_id == "p1")
        })
        .await;

        let (gone, _) = h.factory.created.lock()[0].clone();
        let (kept, _) = h.factory.created.lock()[1].clone();
        for _ in 0..100 {
            if gone.calls().contains(&Call::Close) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone.calls().contains(&Call::Close));
        assert!(!kept.calls().contains(&Call::Close));

        // The same peer id may come back as a fresh spoke
        deliver(&h, join_request("p1"));
        assert_eq!(
            next_signal(&mut h).await,
            SignalCommand::Send(ControlMessage::Offer {
                name: "lobby".into(),
                sdp: "offer-0".into(),
                peer_id: Some("p1".into())
            })
        );
        assert_eq!(h.factory.created.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_close_closes_spokes() {
        let mut h = harness();
        h.signal_in.send(SignalEvent::Open).unwrap();
        next_signal(&mut h).await;
        deliver(&h, join_request("p1"));
        next_signal(&mut h).await;

        h.hub.handle.close();
        wait_for(&mut h, |e| *e == HubEvent::Closed).await;
        assert_eq!(next_signal(&mut h).await, SignalCommand::Close);

        let (state, _) = h.factory.created.lock()[0].clone();
        // Spoke teardown runs on its own task
        for _ in 0..100 {
            if state.calls().contains(&Call::Close) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("spoke transport not closed");
    }
}
