//! Session lifecycle state machine
//!
//! [`SessionMachine`] decides everything about a session: when to register
//! or look up the room, when to answer, when to restart the transport, when
//! to ping the peer and when to give up. It does no I/O. Each input is
//! applied at an explicit instant and produces a list of [`Effect`]s that
//! the async driver in [`crate::session`] carries out. Timer deadlines live
//! here too; the driver sleeps until [`SessionMachine::next_deadline`] and
//! then calls [`SessionMachine::on_timers`].
//!
//! ```text
//!   Idle ──open──▶ Offering (creator) ──answer──▶ Connecting ──up──▶ Connected
//!     │                                               ▲   ◀──degraded──┘
//!     └───open──▶ Joining (joiner) ──offer──▶ OfferReceived ──answer sent──┘
//!
//!   any ──close / idle / channel closed / room_exists──▶ Closed
//! ```

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use duet_core::{DataFrame, IceCandidate, Payload, Role, SessionConfig, TransportState};
use duet_signal::ControlMessage;

/// Named session phases
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the control connection
    Idle,
    /// Creator: offer registered, waiting for an answer
    Offering,
    /// Joiner: polling for the creator's offer
    Joining,
    /// Joiner: offer in hand, answer being produced
    OfferReceived,
    /// Offer and answer exchanged, transport not up
    Connecting,
    /// Transport connected or completed
    Connected,
    /// Terminal
    Closed,
}

/// Timers owned by the machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    JoinRetry,
    ConnectWatchdog,
    KeepaliveInterval,
    KeepaliveTimeout,
    Idle,
}

impl Timer {
    const ALL: [Timer; 5] = [
        Timer::JoinRetry,
        Timer::ConnectWatchdog,
        Timer::KeepaliveInterval,
        Timer::KeepaliveTimeout,
        Timer::Idle,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Events surfaced to the user interface
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Data channel is open
    Open,
    /// Application payload from the peer
    Message(Payload),
    /// Informational status line
    Status(String),
    /// Session closed; emitted exactly once
    Close,
    /// Transport ICE state changed
    IceStateChange(TransportState),
    /// Idle timer restarted with this total duration
    InactivityReset(Duration),
}

/// Something that happened to the session
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    /// Control connection (re)opened
    SignalOpen,
    /// Control connection dropped
    SignalClosed,
    /// Control message from the rendezvous service
    Control(ControlMessage),
    /// Peer connection state changed
    ConnectionState(TransportState),
    /// ICE connection state changed
    IceState(TransportState),
    /// Transport discovered a local candidate
    LocalCandidate(IceCandidate),
    ChannelOpen,
    /// Raw text received on the data channel
    ChannelMessage(String),
    ChannelClosed,
    ChannelError(String),
    /// Local offer created and applied
    LocalOffer { sdp: String, ice_restart: bool },
    /// Local answer created and applied
    LocalAnswer(String),
    /// An offer, answer or description step failed
    NegotiationFailed(String),
    /// Application text was sent on the data channel
    Sent,
    /// Manual retry requested
    Retry,
    /// Explicit close
    Close,
}

/// Work for the driver
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Send a control message over the rendezvous connection
    Signal(ControlMessage),
    /// Handshake done; the rendezvous connection may drop for good
    SignalConnected,
    /// Create and apply a local offer, then report [`Input::LocalOffer`]
    CreateOffer { ice_restart: bool },
    /// Apply a remote offer, create and apply an answer, then report [`Input::LocalAnswer`]
    AcceptOffer(String),
    /// Apply a remote answer
    ApplyAnswer(String),
    /// Add a remote candidate
    AddCandidate(IceCandidate),
    /// Send a raw frame on the data channel
    SendFrame(String),
    /// Surface an event to the user interface
    Emit(SessionEvent),
    /// Close the transport and the rendezvous connection
    Teardown,
}

/// Pure session lifecycle controller
pub struct SessionMachine {
    name: String,
    role: Role,
    /// Routing key when this session is one spoke of a hub
    peer_id: Option<String>,
    config: SessionConfig,

    phase: Phase,
    transport_state: TransportState,
    signal_open: bool,
    unreachable_reported: bool,

    has_remote_offer: bool,
    remote_offer: Option<String>,
    local_offer: Option<String>,
    /// Offer and answer have crossed at least once
    exchanged: bool,
    /// A locally created offer is waiting for its answer
    awaiting_answer: bool,
    is_connected: bool,
    connected_once: bool,
    channel_opened: bool,

    join_started: Option<Instant>,
    join_attempt: u32,
    join_done: bool,

    blind_restarts: u32,
    /// Creator already restarted during the current degraded episode
    episode_restarted: bool,

    ping_seq: u64,
    awaiting_pong: Option<u64>,
    missed_pongs: u32,
    last_keepalive_restart: Option<Instant>,

    last_activity: Option<Instant>,
    timers: [Option<Instant>; 5],
}

impl SessionMachine {
    pub fn new(name: impl Into<String>, role: Role, config: SessionConfig) -> Self {
        Self {
            name: name.into(),
            role,
            peer_id: None,
            config,
            phase: Phase::Idle,
            transport_state: TransportState::New,
            signal_open: false,
            unreachable_reported: false,
            has_remote_offer: false,
            remote_offer: None,
            local_offer: None,
            exchanged: false,
            awaiting_answer: false,
            is_connected: false,
            connected_once: false,
            channel_opened: false,
            join_started: None,
            join_attempt: 0,
            join_done: false,
            blind_restarts: 0,
            episode_restarted: false,
            ping_seq: 0,
            awaiting_pong: None,
            missed_pongs: 0,
            last_keepalive_restart: None,
            last_activity: None,
            timers: [None; 5],
        }
    }

    /// Creator-side spoke of a hub room, addressed by `peer_id`
    pub fn hub_peer(name: impl Into<String>, peer_id: String, config: SessionConfig) -> Self {
        let mut machine = Self::new(name, Role::Creator, config);
        machine.peer_id = Some(peer_id);
        machine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport_state
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn has_remote_offer(&self) -> bool {
        self.has_remote_offer
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Last genuine application traffic in either direction
    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Blind restarts spent by the connect watchdog in this episode
    pub fn blind_restarts(&self) -> u32 {
        self.blind_restarts
    }

    pub fn deadline(&self, timer: Timer) -> Option<Instant> {
        self.timers[timer.index()]
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().flatten().min().copied()
    }

    /// Apply one input
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.is_closed() {
            debug!("[{}] ignoring {:?} after close", self.name, input);
            return fx;
        }

        match input {
            Input::SignalOpen => self.on_signal_open(now, &mut fx),
            Input::SignalClosed => self.on_signal_closed(&mut fx),
            Input::Control(msg) => self.on_control(msg, now, &mut fx),
            Input::ConnectionState(state) => self.on_connection_state(state, now, &mut fx),
            Input::IceState(state) => {
                debug!("[{}] ice state {}", self.name, state);
                fx.push(Effect::Emit(SessionEvent::IceStateChange(state)));
            }
            Input::LocalCandidate(candidate) => {
                if self.signal_open {
                    fx.push(Effect::Signal(ControlMessage::candidate(
                        &self.name,
                        candidate,
                        self.peer_id.clone(),
                    )));
                } else {
                    debug!("[{}] dropping local candidate, rendezvous closed", self.name);
                }
            }
            Input::ChannelOpen => {
                if !self.channel_opened {
                    self.channel_opened = true;
                    fx.push(Effect::Emit(SessionEvent::Open));
                }
            }
            Input::ChannelMessage(text) => self.on_channel_message(&text, now, &mut fx),
            Input::ChannelClosed => self.close("data channel closed", &mut fx),
            Input::ChannelError(e) => self.close(&format!("data channel error: {}", e), &mut fx),
            Input::LocalOffer { sdp, ice_restart } => {
                self.on_local_offer(sdp, ice_restart, now, &mut fx)
            }
            Input::LocalAnswer(sdp) => self.on_local_answer(sdp, &mut fx),
            Input::NegotiationFailed(reason) => {
                warn!("[{}] negotiation failed: {}", self.name, reason);
                self.awaiting_answer = false;
                status(&mut fx, format!("negotiation failed: {}", reason));
            }
            Input::Sent => self.record_activity(now, &mut fx),
            Input::Retry => self.on_retry(now, &mut fx),
            Input::Close => self.close("", &mut fx),
        }

        fx
    }

    /// Fire every timer due at `now`
    pub fn on_timers(&mut self, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        for timer in Timer::ALL {
            if self.is_closed() {
                break;
            }
            let due = self.timers[timer.index()].is_some_and(|at| at <= now);
            if due {
                self.disarm(timer);
                self.on_timer(timer, now, &mut fx);
            }
        }
        fx
    }

    fn on_timer(&mut self, timer: Timer, now: Instant, fx: &mut Vec<Effect>) {
        debug!("[{}] timer {:?} fired", self.name, timer);
        match timer {
            Timer::JoinRetry => self.send_join(now, fx),
            Timer::ConnectWatchdog => self.on_watchdog(now, fx),
            Timer::KeepaliveInterval => {
                if !self.is_connected {
                    return;
                }
                if self.awaiting_pong.is_none() {
                    self.ping_seq += 1;
                    self.awaiting_pong = Some(self.ping_seq);
                    fx.push(Effect::SendFrame(DataFrame::Ping(self.ping_seq).encode()));
                    self.arm(Timer::KeepaliveTimeout, now + self.config.keepalive_timeout());
                }
                self.arm(Timer::KeepaliveInterval, now + self.config.keepalive_interval());
            }
            Timer::KeepaliveTimeout => self.on_pong_missed(now, fx),
            Timer::Idle => self.close("closed due to inactivity", fx),
        }
    }

    fn on_signal_open(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.signal_open = true;
        self.unreachable_reported = false;
        if self.connected_once {
            return;
        }

        match self.role {
            Role::Creator if self.exchanged => {}
            Role::Creator => match self.local_offer.clone() {
                Some(sdp) => self.register_offer(sdp, now, fx),
                None => {
                    if self.phase == Phase::Idle {
                        self.phase = Phase::Offering;
                        fx.push(Effect::CreateOffer { ice_restart: false });
                    }
                }
            },
            Role::Joiner => {
                if !self.has_remote_offer {
                    self.start_join_loop(now, fx);
                }
            }
        }
    }

    fn on_signal_closed(&mut self, fx: &mut Vec<Effect>) {
        let was_open = std::mem::replace(&mut self.signal_open, false);
        self.disarm(Timer::JoinRetry);
        if self.connected_once {
            return;
        }
        if was_open {
            status(fx, "rendezvous connection lost, reconnecting");
        } else if !self.unreachable_reported {
            self.unreachable_reported = true;
            status(fx, "rendezvous unavailable, retrying");
        }
    }

    fn on_control(&mut self, msg: ControlMessage, now: Instant, fx: &mut Vec<Effect>) {
        debug!("[{}] control {}", self.name, msg.kind());
        match msg {
            ControlMessage::Created { .. } => status(fx, "waiting for peer"),
            ControlMessage::Offer { sdp, .. } => self.on_remote_offer(sdp, now, fx),
            ControlMessage::Answer { sdp, .. } => {
                if !self.awaiting_answer {
                    debug!("[{}] ignoring unsolicited answer", self.name);
                    return;
                }
                self.awaiting_answer = false;
                fx.push(Effect::ApplyAnswer(sdp));
                if self.peer_id.is_some() && !self.connected_once {
                    self.arm(Timer::ConnectWatchdog, now + self.config.connect_watchdog());
                }
                if !self.exchanged {
                    self.exchanged = true;
                    if !self.is_connected {
                        self.phase = Phase::Connecting;
                    }
                    status(fx, "peer found, connecting");
                }
            }
            ControlMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => fx.push(Effect::AddCandidate(IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            })),
            ControlMessage::NotFound { .. } => {
                if self.role != Role::Joiner || self.has_remote_offer || self.is_connected {
                    debug!("[{}] ignoring stale not_found", self.name);
                    return;
                }
                status(fx, format!("room {} not found yet, still looking", self.name));
                // The service's own wait outlasted our loop; poll again
                if self.join_done {
                    self.start_join_loop(now, fx);
                }
            }
            ControlMessage::Error { error } => match error.as_str() {
                "room_exists" => self.close(
                    &format!("room name {} is already in use, pick another", self.name),
                    fx,
                ),
                "room_expired" => self.close("room expired before a peer joined", fx),
                "room_not_found" | "not_paired"
                    if self.role == Role::Joiner && self.has_remote_offer && !self.connected_once =>
                {
                    self.drop_stale_offer(now, fx)
                }
                other => status(fx, format!("rendezvous error: {}", other)),
            },
            ControlMessage::PeerLeft { .. } => {
                if !self.connected_once {
                    self.close("peer left before connecting", fx);
                }
            }
            ControlMessage::Ack => {}
            other => debug!("[{}] ignoring {}", self.name, other.kind()),
        }
    }

    /// The room behind our offer is gone; forget it and look again
    fn drop_stale_offer(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        info!("[{}] offer went stale before connecting", self.name);
        self.has_remote_offer = false;
        self.remote_offer = None;
        self.exchanged = false;
        self.awaiting_answer = false;
        self.blind_restarts = 0;
        self.disarm(Timer::ConnectWatchdog);
        if self.signal_open {
            status(fx, "offer went stale, looking for the room again");
            self.start_join_loop(now, fx);
        } else {
            self.phase = Phase::Idle;
            status(fx, "offer went stale, waiting for rendezvous connection");
        }
    }

    fn on_remote_offer(&mut self, sdp: String, now: Instant, fx: &mut Vec<Effect>) {
        if self.remote_offer.as_deref() == Some(sdp.as_str()) {
            debug!("[{}] duplicate offer ignored", self.name);
            return;
        }

        if self.role == Role::Joiner && !self.has_remote_offer {
            self.has_remote_offer = true;
            self.remote_offer = Some(sdp.clone());
            self.disarm(Timer::JoinRetry);
            self.join_done = true;
            self.phase = Phase::OfferReceived;
            fx.push(Effect::AcceptOffer(sdp));
            self.arm(Timer::ConnectWatchdog, now + self.config.connect_watchdog());
            status(fx, "offer received, connecting");
            return;
        }

        if !self.exchanged {
            debug!("[{}] offer before handshake ignored", self.name);
            return;
        }
        if self.awaiting_answer && self.role == Role::Creator {
            // Both sides restarted at once; the creator's offer wins
            debug!("[{}] restart offer collision, keeping ours", self.name);
            return;
        }

        debug!("[{}] peer requested renegotiation", self.name);
        self.awaiting_answer = false;
        self.remote_offer = Some(sdp.clone());
        fx.push(Effect::AcceptOffer(sdp));
    }

    fn on_local_offer(
        &mut self,
        sdp: String,
        ice_restart: bool,
        now: Instant,
        fx: &mut Vec<Effect>,
    ) {
        if ice_restart || self.exchanged {
            self.awaiting_answer = true;
            if self.signal_open {
                fx.push(Effect::Signal(ControlMessage::Offer {
                    name: self.name.clone(),
                    sdp,
                    peer_id: self.peer_id.clone(),
                }));
            } else {
                status(fx, "restart offer not sent, rendezvous unavailable");
            }
            return;
        }

        self.local_offer = Some(sdp.clone());
        self.awaiting_answer = true;
        if self.signal_open {
            self.register_offer(sdp, now, fx);
        }
    }

    /// Put the initial offer in front of the other side
    fn register_offer(&mut self, sdp: String, now: Instant, fx: &mut Vec<Effect>) {
        self.phase = Phase::Offering;
        if self.peer_id.is_some() {
            // A spoke's joiner is already present, so the handshake is bounded
            self.arm(Timer::ConnectWatchdog, now + self.config.connect_watchdog());
        }
        let msg = match &self.peer_id {
            Some(peer_id) => ControlMessage::Offer {
                name: self.name.clone(),
                sdp,
                peer_id: Some(peer_id.clone()),
            },
            None => ControlMessage::Create {
                name: self.name.clone(),
                sdp,
            },
        };
        fx.push(Effect::Signal(msg));
    }

    fn on_local_answer(&mut self, sdp: String, fx: &mut Vec<Effect>) {
        fx.push(Effect::Signal(ControlMessage::Answer {
            name: self.name.clone(),
            sdp,
            peer_id: self.peer_id.clone(),
        }));
        if !self.exchanged {
            self.exchanged = true;
            if !self.is_connected {
                self.phase = Phase::Connecting;
            }
        }
    }

    fn on_connection_state(&mut self, state: TransportState, now: Instant, fx: &mut Vec<Effect>) {
        debug!("[{}] transport {} -> {}", self.name, self.transport_state, state);
        self.transport_state = state;

        if state.is_up() {
            if self.is_connected {
                return;
            }
            info!("[{}] connected", self.name);
            self.is_connected = true;
            self.phase = Phase::Connected;
            self.disarm(Timer::JoinRetry);
            self.disarm(Timer::ConnectWatchdog);
            self.join_done = true;
            self.blind_restarts = 0;
            self.episode_restarted = false;
            self.start_keepalive(now);
            if !self.connected_once {
                self.connected_once = true;
                fx.push(Effect::SignalConnected);
            }
            self.record_activity(now, fx);
            status(fx, "connected");
        } else if state.is_degraded() {
            if self.is_connected {
                self.is_connected = false;
                self.phase = Phase::Connecting;
                self.disarm(Timer::KeepaliveInterval);
                self.disarm(Timer::KeepaliveTimeout);
                self.awaiting_pong = None;
                status(fx, format!("connection {}", state));
            }
            if self.role == Role::Creator && self.exchanged && !self.episode_restarted {
                self.episode_restarted = true;
                status(fx, "attempting to restore connection");
                self.begin_restart(fx);
            }
        } else if state == TransportState::Closed {
            self.close("connection closed", fx);
        }
    }

    fn on_channel_message(&mut self, text: &str, now: Instant, fx: &mut Vec<Effect>) {
        match DataFrame::decode(text) {
            DataFrame::Ping(seq) => fx.push(Effect::SendFrame(DataFrame::Pong(seq).encode())),
            DataFrame::Pong(seq) => {
                if self.awaiting_pong == Some(seq) {
                    self.awaiting_pong = None;
                    self.missed_pongs = 0;
                    self.disarm(Timer::KeepaliveTimeout);
                }
            }
            DataFrame::Control(body) => debug!("[{}] unknown control frame {:?}", self.name, body),
            DataFrame::App(payload) => {
                self.record_activity(now, fx);
                fx.push(Effect::Emit(SessionEvent::Message(payload)));
            }
        }
    }

    fn on_retry(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        info!("[{}] manual retry", self.name);
        self.blind_restarts = 0;
        self.episode_restarted = false;
        status(fx, "retrying");

        match self.role {
            Role::Joiner if !self.has_remote_offer => {
                if self.signal_open {
                    self.start_join_loop(now, fx);
                } else {
                    status(fx, "waiting for rendezvous connection");
                }
            }
            Role::Creator if self.local_offer.is_none() => {
                fx.push(Effect::CreateOffer { ice_restart: false });
            }
            Role::Creator if !self.exchanged => {
                if let (true, Some(sdp)) = (self.signal_open, self.local_offer.clone()) {
                    self.register_offer(sdp, now, fx);
                }
            }
            _ => {
                self.begin_restart(fx);
                if self.role == Role::Joiner && !self.is_connected {
                    self.arm(Timer::ConnectWatchdog, now + self.config.connect_watchdog());
                }
            }
        }
    }

    fn start_join_loop(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.phase = Phase::Joining;
        self.join_started = Some(now);
        self.join_attempt = 0;
        self.join_done = false;
        status(fx, format!("looking for room {}", self.name));
        self.send_join(now, fx);
    }

    /// Send one `join` and schedule the next, clamped to the total budget
    fn send_join(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.join_done || !self.signal_open || self.has_remote_offer || self.is_connected {
            return;
        }
        let Some(started) = self.join_started else {
            return;
        };

        fx.push(Effect::Signal(ControlMessage::Join {
            name: self.name.clone(),
        }));

        let budget_end = started + self.config.join_retry_total();
        if now >= budget_end {
            debug!("[{}] final join sent, waiting passively", self.name);
            self.join_done = true;
            return;
        }

        let next = now + self.config.join_retry_delay(self.join_attempt);
        self.join_attempt += 1;
        self.arm(Timer::JoinRetry, next.min(budget_end));
    }

    fn on_watchdog(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if self.is_connected {
            return;
        }
        if self.peer_id.is_some() {
            if !self.connected_once {
                self.close("peer did not finish connecting", fx);
            }
            return;
        }
        if self.role != Role::Joiner {
            return;
        }
        if self.blind_restarts >= self.config.max_blind_restarts {
            warn!("[{}] connect watchdog exhausted", self.name);
            status(fx, "connection could not be established, use /retry to try again");
            return;
        }

        self.blind_restarts += 1;
        status(
            fx,
            format!(
                "connection stalled, restarting ({}/{})",
                self.blind_restarts, self.config.max_blind_restarts
            ),
        );
        self.begin_restart(fx);
        self.arm(Timer::ConnectWatchdog, now + self.config.connect_watchdog());
    }

    fn on_pong_missed(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.awaiting_pong = None;
        self.missed_pongs += 1;
        debug!("[{}] keepalive miss {}", self.name, self.missed_pongs);
        if self.missed_pongs < self.config.keepalive_miss_threshold {
            return;
        }
        self.missed_pongs = 0;

        let cooled = self
            .last_keepalive_restart
            .map_or(true, |at| now.duration_since(at) >= self.config.keepalive_restart_cooldown());
        if cooled {
            self.last_keepalive_restart = Some(now);
            status(fx, "peer not responding, restarting connection");
            self.begin_restart(fx);
        } else {
            status(fx, "peer not responding");
        }
    }

    fn begin_restart(&mut self, fx: &mut Vec<Effect>) {
        info!("[{}] restarting transport", self.name);
        fx.push(Effect::CreateOffer { ice_restart: true });
    }

    fn start_keepalive(&mut self, now: Instant) {
        self.awaiting_pong = None;
        self.missed_pongs = 0;
        self.disarm(Timer::KeepaliveTimeout);
        self.arm(Timer::KeepaliveInterval, now + self.config.keepalive_interval());
    }

    /// Genuine application traffic restarts the idle timer
    fn record_activity(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        if !self.connected_once {
            return;
        }
        let idle = self.config.idle_timeout();
        self.last_activity = Some(now);
        self.arm(Timer::Idle, now + idle);
        fx.push(Effect::Emit(SessionEvent::InactivityReset(idle)));
    }

    fn close(&mut self, reason: &str, fx: &mut Vec<Effect>) {
        if self.is_closed() {
            return;
        }
        info!("[{}] closing: {}", self.name, if reason.is_empty() { "requested" } else { reason });
        self.phase = Phase::Closed;
        self.is_connected = false;
        self.timers = [None; 5];
        if !reason.is_empty() {
            status(fx, reason);
        }
        fx.push(Effect::Teardown);
        fx.push(Effect::Emit(SessionEvent::Close));
    }

    fn arm(&mut self, timer: Timer, at: Instant) {
        self.timers[timer.index()] = Some(at);
    }

    fn disarm(&mut self, timer: Timer) {
        self.timers[timer.index()] = None;
    }
}

fn status(fx: &mut Vec<Effect>, text: impl Into<String>) {
    fx.push(Effect::Emit(SessionEvent::Status(text.into())));
}
