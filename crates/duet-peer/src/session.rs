//! Async session driver
//!
//! One task per session owns the [`SessionMachine`], the transport and the
//! signal link. It waits on transport events, control messages, user
//! commands and the machine's next timer deadline, feeds whatever arrives
//! into the machine, and carries out the resulting effects in order.
//! Results of asynchronous transport calls (offers, answers) go back into
//! the machine as inputs before the next event is taken.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use duet_core::{Config, DataFrame, Role, TransportError};

use crate::machine::{Effect, Input, SessionEvent, SessionMachine};
use crate::rendezvous::{RendezvousClient, SignalCommand, SignalEvent, SignalLink};
use crate::transport::{EventReceiver, Transport, TransportFactory};
use crate::webrtc::WebRtcFactory;

/// User requests
#[derive(Debug)]
enum Command {
    Send(String, oneshot::Sender<bool>),
    Retry,
    Close,
}

/// Cloneable handle used by the user interface
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Send a text payload. `false` when the data channel is not open.
    pub async fn send(&self, text: impl Into<String>) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Send(text.into(), reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Reset the restart budget and try again
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Close the session. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// A running session
pub struct Session {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<()>,
}

impl Session {
    /// Start a session against the configured signal server over WebRTC
    pub async fn start(name: &str, role: Role, config: &Config) -> Result<Self, TransportError> {
        let factory = WebRtcFactory::new(config.transport.clone());
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = factory.create(role, transport_tx).await?;

        let (link, _client) = RendezvousClient::new(config.rendezvous.clone()).spawn();
        let machine = SessionMachine::new(name, role, config.session.clone());
        Ok(Self::spawn(machine, transport, transport_rx, link))
    }

    /// Drive `machine` with an already built transport and signal link
    pub fn spawn(
        machine: SessionMachine,
        transport: Box<dyn Transport>,
        transport_events: EventReceiver,
        link: SignalLink,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            machine,
            transport,
            signal: link.commands,
            ui: ui_tx,
        };
        let task = tokio::spawn(driver.run(transport_events, link.events, cmd_rx));

        Self {
            handle: SessionHandle { commands: cmd_tx },
            events: ui_rx,
            task,
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// What woke the driver
enum Wake {
    Input(Input),
    Timers,
    Nothing,
}

struct Driver {
    machine: SessionMachine,
    transport: Box<dyn Transport>,
    signal: mpsc::UnboundedSender<SignalCommand>,
    ui: mpsc::UnboundedSender<SessionEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut transport_events: EventReceiver,
        mut signal_events: mpsc::UnboundedReceiver<SignalEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut transport_alive = true;
        let mut signal_alive = true;

        while !self.machine.is_closed() {
            let deadline = self.machine.next_deadline();

            let wake = tokio::select! {
                event = transport_events.recv(), if transport_alive => match event {
                    Some(event) => Wake::Input(event.into()),
                    None => {
                        transport_alive = false;
                        Wake::Nothing
                    }
                },
                event = signal_events.recv(), if signal_alive => match event {
                    Some(SignalEvent::Open) => Wake::Input(Input::SignalOpen),
                    Some(SignalEvent::Message(msg)) => Wake::Input(Input::Control(msg)),
                    Some(SignalEvent::Closed) => Wake::Input(Input::SignalClosed),
                    None => {
                        signal_alive = false;
                        Wake::Nothing
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Send(text, reply)) => {
                        let sent = self.send_text(text).await;
                        let _ = reply.send(sent);
                        Wake::Nothing
                    }
                    Some(Command::Retry) => Wake::Input(Input::Retry),
                    Some(Command::Close) | None => Wake::Input(Input::Close),
                },
                _ = sleep_until(deadline) => Wake::Timers,
            };

            let effects = match wake {
                Wake::Input(input) => self.machine.handle(input, now()),
                Wake::Timers => self.machine.on_timers(now()),
                Wake::Nothing => continue,
            };
            self.apply(effects).await;
        }

        // Late senders get a clean refusal
        commands.close();
        while let Some(cmd) = commands.recv().await {
            if let Command::Send(_, reply) = cmd {
                let _ = reply.send(false);
            }
        }
        debug!("[{}] driver stopped", self.machine.name());
    }

    async fn send_text(&mut self, text: String) -> bool {
        if self.machine.is_closed() || !self.transport.channel_open() {
            return false;
        }
        if DataFrame::decode(&text).is_control() {
            warn!("[{}] refusing to send reserved frame prefix", self.machine.name());
            return false;
        }
        match self.transport.send_text(&text).await {
            Ok(()) => {
                let effects = self.machine.handle(Input::Sent, now());
                self.apply(effects).await;
                true
            }
            Err(e) => {
                debug!("[{}] send failed: {}", self.machine.name(), e);
                false
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Signal(msg) => {
                    if self.signal.send(SignalCommand::Send(msg)).is_err() {
                        debug!("[{}] signal link gone", self.machine.name());
                    }
                }
                Effect::SignalConnected => {
                    let _ = self.signal.send(SignalCommand::Connected);
                }
                Effect::CreateOffer { ice_restart } => {
                    let input = match self.transport.create_offer(ice_restart).await {
                        Ok(sdp) => Input::LocalOffer { sdp, ice_restart },
                        Err(e) => Input::NegotiationFailed(e.to_string()),
                    };
                    queue.extend(self.machine.handle(input, now()));
                }
                Effect::AcceptOffer(sdp) => {
                    let input = match self.transport.accept_offer(sdp).await {
                        Ok(answer) => Input::LocalAnswer(answer),
                        Err(e) => Input::NegotiationFailed(e.to_string()),
                    };
                    queue.extend(self.machine.handle(input, now()));
                }
                Effect::ApplyAnswer(sdp) => {
                    if let Err(e) = self.transport.accept_answer(sdp).await {
                        let input = Input::NegotiationFailed(e.to_string());
                        queue.extend(self.machine.handle(input, now()));
                    }
                }
                Effect::AddCandidate(candidate) => {
                    if let Err(e) = self.transport.add_remote_candidate(candidate).await {
                        warn!("[{}] failed to add candidate: {}", self.machine.name(), e);
                    }
                }
                Effect::SendFrame(frame) => {
                    if let Err(e) = self.transport.send_text(&frame).await {
                        debug!("[{}] control frame not sent: {}", self.machine.name(), e);
                    }
                }
                Effect::Emit(event) => {
                    let _ = self.ui.send(event);
                }
                Effect::Teardown => {
                    self.transport.close().await;
                    let _ = self.signal.send(SignalCommand::Close);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use duet_core::frame::CONTROL_PREFIX;
    use duet_core::{Payload, SessionConfig, TransportState};
    use duet_signal::ControlMessage;

    use crate::transport::mock::{Call, MockState, MockTransport};
    use crate::transport::{EventSender, TransportEvent};

    struct Harness {
        session: Session,
        state: Arc<MockState>,
        transport: EventSender,
        signal_in: mpsc::UnboundedSender<SignalEvent>,
        signal_out: mpsc::UnboundedReceiver<SignalCommand>,
    }

    fn harness(role: Role) -> Harness {
        let state = Arc::new(MockState::default());
        let transport = Box::new(MockTransport {
            state: state.clone(),
        });
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (link, signal_out, signal_in) = SignalLink::pair();
        let machine = SessionMachine::new("room", role, SessionConfig::default());

        Harness {
            session: Session::spawn(machine, transport, transport_rx, link),
            state,
            transport: transport_tx,
            signal_in,
            signal_out,
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
                .await
                .expect("event in time")
                .expect("session still running");
            if pred(&event) {
                return event;
            }
        }
    }

    async fn next_signal(out: &mut mpsc::UnboundedReceiver<SignalCommand>) -> SignalCommand {
        out.recv().await.expect("signal command")
    }

    fn is_status(event: &SessionEvent, needle: &str) -> bool {
        matches!(event, SessionEvent::Status(s) if s.contains(needle))
    }

    async fn connect_creator(h: &mut Harness) {
        h.signal_in.send(SignalEvent::Open).unwrap();
        assert_eq!(
            next_signal(&mut h.signal_out).await,
            SignalCommand::Send(ControlMessage::Create {
                name: "room".into(),
                sdp: "offer-0".into()
            })
        );
        h.signal_in
            .send(SignalEvent::Message(ControlMessage::Answer {
                name: "room".into(),
                sdp: "answer".into(),
                peer_id: None,
            }))
            .unwrap();
        wait_for(&mut h.session.events, |e| is_status(e, "peer found")).await;
        h.state.channel_open.store(true, Ordering::SeqCst);
        h.transport
            .send(TransportEvent::ConnectionState(TransportState::Connected))
            .unwrap();
        assert_eq!(next_signal(&mut h.signal_out).await, SignalCommand::Connected);
        wait_for(&mut h.session.events, |e| is_status(e, "connected")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_creator_session_roundtrip() {
        let mut h = harness(Role::Creator);
        connect_creator(&mut h).await;
        assert!(h.state.calls().contains(&Call::AcceptAnswer("answer".into())));

        h.transport.send(TransportEvent::ChannelOpen).unwrap();
        wait_for(&mut h.session.events, |e| *e == SessionEvent::Open).await;

        assert!(h.session.handle.send("hi").await);
        assert!(h.state.sent().contains(&"hi".to_string()));

        // Keepalive-shaped text never leaves as application data
        assert!(!h.session.handle.send(format!("{CONTROL_PREFIX}ping:7")).await);
        assert!(!h.state.sent().iter().any(|f| f.ends_with("ping:7")));

        h.transport
            .send(TransportEvent::ChannelMessage("yo".into()))
            .unwrap();
        let msg = wait_for(&mut h.session.events, |e| {
            matches!(e, SessionEvent::Message(_))
        })
        .await;
        assert_eq!(msg, SessionEvent::Message(Payload::Text("yo".into())));

        h.session.handle.close();
        wait_for(&mut h.session.events, |e| *e == SessionEvent::Close).await;
        assert_eq!(next_signal(&mut h.signal_out).await, SignalCommand::Close);
        assert!(h.state.calls().contains(&Call::Close));
        assert!(!h.session.handle.send("late").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joiner_answers_offer_and_applies_candidates() {
        let mut h = harness(Role::Joiner);
        h.signal_in.send(SignalEvent::Open).unwrap();
        assert_eq!(
            next_signal(&mut h.signal_out).await,
            SignalCommand::Send(ControlMessage::Join { name: "room".into() })
        );

        h.signal_in
            .send(SignalEvent::Message(ControlMessage::Offer {
                name: "room".into(),
                sdp: "remote".into(),
                peer_id: None,
            }))
            .unwrap();
        assert_eq!(
            next_signal(&mut h.signal_out).await,
            SignalCommand::Send(ControlMessage::Answer {
                name: "room".into(),
                sdp: "answer-to-remote".into(),
                peer_id: None
            })
        );

        h.signal_in
            .send(SignalEvent::Message(ControlMessage::Candidate {
                name: "room".into(),
                candidate: "cand".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                peer_id: None,
            }))
            .unwrap();
        // Same channel as the candidate, so it is handled afterwards
        h.signal_in
            .send(SignalEvent::Message(ControlMessage::Error {
                error: "overloaded".into(),
            }))
            .unwrap();
        wait_for(&mut h.session.events, |e| is_status(e, "overloaded")).await;
        assert!(h.state.calls().contains(&Call::AddCandidate("cand".into())));

        h.transport
            .send(TransportEvent::IceState(TransportState::Checking))
            .unwrap();
        wait_for(&mut h.session.events, |e| {
            *e == SessionEvent::IceStateChange(TransportState::Checking)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_are_paced_by_the_clock() {
        let mut h = harness(Role::Joiner);
        let start = tokio::time::Instant::now();
        h.signal_in.send(SignalEvent::Open).unwrap();

        let mut last = start;
        for _ in 0..3 {
            assert!(matches!(
                next_signal(&mut h.signal_out).await,
                SignalCommand::Send(ControlMessage::Join { .. })
            ));
            last = tokio::time::Instant::now();
        }
        // Immediate, +600 ms, +840 ms
        assert_eq!(last - start, Duration::from_millis(1440));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let mut h = harness(Role::Creator);
        connect_creator(&mut h).await;
        let connected_at = tokio::time::Instant::now();

        wait_for(&mut h.session.events, |e| {
            is_status(e, "closed due to inactivity")
        })
        .await;
        wait_for(&mut h.session.events, |e| *e == SessionEvent::Close).await;
        assert!(connected_at.elapsed() >= Duration::from_secs(120));

        // Pings went out while idle, none reached the UI as messages
        assert!(h.state.sent().iter().any(|f| f.starts_with(CONTROL_PREFIX)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_close_emits_one_close() {
        let mut h = harness(Role::Creator);
        connect_creator(&mut h).await;

        h.session.handle.close();
        h.session.handle.close();

        let mut closes = 0;
        while let Some(event) = h.session.events.recv().await {
            if event == SessionEvent::Close {
                closes += 1;
            }
        }
        assert_eq!(closes, 1);
        assert_eq!(
            h.state
                .calls()
                .iter()
                .filter(|c| **c == Call::Close)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_refused_without_open_channel() {
        let h = harness(Role::Creator);
        assert!(!h.session.handle.send("too early").await);
        assert!(h.state.sent().is_empty());
    }
}
