//! Room matching and relay state
//!
//! The registry is owned by a single coordinator task. Every mutation goes
//! through [`Registry::handle`], [`Registry::disconnect`] or
//! [`Registry::expire`], each of which returns the messages to deliver.
//! Nothing here touches a socket, so no lock is ever held across a send.
//!
//! Room lifecycle (single-peer): `absent -> pending -> deleted`, where
//! deletion happens on a relayed answer, owner disconnect or TTL expiry.
//! After a relayed answer the two connections stay paired so later
//! candidates and restart offers/answers reach the partner.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info};

use duet_core::SignalConfig;

use crate::messages::{ControlMessage, ErrorCode};
use crate::room::{HubPeer, Room, RoomMode};
use crate::ConnId;

/// A delivery produced by the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Send a message to a connection
    Send(ConnId, ControlMessage),
    /// Close a connection
    Close(ConnId),
}

/// A joiner waiting for a creator to show up
#[derive(Debug, Clone, Copy)]
struct Waiter {
    conn: ConnId,
    deadline: Instant,
}

/// Matching state for all live rooms
pub struct Registry {
    config: SignalConfig,
    /// Live rooms by name
    rooms: HashMap<String, Room>,
    /// Owner connection to the room it owns
    owners: HashMap<ConnId, String>,
    /// Joiners waiting on a name that has no room yet
    waiters: HashMap<String, Vec<Waiter>>,
    /// Hub joiner connection to hub room name
    hub_members: HashMap<ConnId, String>,
    /// Connections paired by a completed single-peer handshake
    links: HashMap<ConnId, ConnId>,
    /// Fallback peer id counter when the system RNG is unavailable
    peer_seq: u64,
}

impl Registry {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            rooms: HashMap::new(),
            owners: HashMap::new(),
            waiters: HashMap::new(),
            hub_members: HashMap::new(),
            links: HashMap::new(),
            peer_seq: 0,
        }
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether a live room uses this name
    pub fn contains_room(&self, name: &str) -> bool {
        self.rooms.contains_key(name)
    }

    /// Number of joiners waiting for a creator
    pub fn waiter_count(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    /// Partner of a paired connection
    pub fn partner_of(&self, conn: ConnId) -> Option<ConnId> {
        self.links.get(&conn).copied()
    }

    /// Earliest pending join wait or room TTL
    pub fn next_deadline(&self) -> Option<Instant> {
        let waits = self.waiters.values().flatten().map(|w| w.deadline);
        let ttls = self.rooms.values().filter_map(Room::expires_at);
        waits.chain(ttls).min()
    }

    /// Handle one inbound control message from `conn`
    pub fn handle(&mut self, conn: ConnId, msg: ControlMessage, now: Instant) -> Vec<Outbound> {
        debug!("conn {} -> {}", conn, msg.kind());
        let mut out = Vec::new();

        match msg {
            ControlMessage::Create { name, sdp } => {
                self.create(conn, name, sdp, now, &mut out);
            }
            ControlMessage::CreateMulti { name, key } => {
                self.create_multi(conn, name, key, now, &mut out);
            }
            ControlMessage::Join { name } => {
                self.join(conn, name, now, &mut out);
            }
            ControlMessage::Offer { name, sdp, peer_id } => {
                self.relay_offer(conn, name, sdp, peer_id, &mut out);
            }
            ControlMessage::Answer { name, sdp, peer_id } => {
                self.relay_answer(conn, name, sdp, peer_id, &mut out);
            }
            msg @ ControlMessage::Candidate { .. } => {
                self.relay_candidate(conn, msg, &mut out);
            }
            ControlMessage::Created { .. }
            | ControlMessage::NotFound { .. }
            | ControlMessage::JoinRequest { .. }
            | ControlMessage::PeerLeft { .. }
            | ControlMessage::Ack
            | ControlMessage::Error { .. } => {
                out.push(Outbound::Send(
                    conn,
                    ControlMessage::error(ErrorCode::UnexpectedMessage),
                ));
            }
        }

        out
    }

    fn create(
        &mut self,
        conn: ConnId,
        name: String,
        sdp: String,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) {
        if self.rooms.get(&name).is_some_and(|room| room.owner != conn) {
            out.push(Outbound::Send(conn, ControlMessage::error(ErrorCode::RoomExists)));
            return;
        }

        self.release_owned(conn);
        let room = Room::single(name.clone(), conn, sdp, self.config.room_ttl(), now);
        self.rooms.insert(name.clone(), room);
        self.owners.insert(conn, name.clone());
        info!("Room created: {} by conn {}", name, conn);

        out.push(Outbound::Send(
            conn,
            ControlMessage::Created {
                name: name.clone(),
                multi: false,
            },
        ));

        for waiter in self.waiters.remove(&name).unwrap_or_default() {
            self.offer_to(&name, waiter.conn, out);
        }
    }

    fn create_multi(
        &mut self,
        conn: ConnId,
        name: String,
        key: String,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) {
        if !self.config.hub_keys.is_empty() && !self.config.hub_keys.contains(&key) {
            out.push(Outbound::Send(conn, ControlMessage::error(ErrorCode::InvalidKey)));
            return;
        }

        if self.rooms.get(&name).is_some_and(|room| room.owner != conn) {
            out.push(Outbound::Send(conn, ControlMessage::error(ErrorCode::RoomExists)));
            return;
        }

        self.release_owned(conn);
        self.rooms.insert(name.clone(), Room::hub(name.clone(), conn, now));
        self.owners.insert(conn, name.clone());
        info!("Hub room created: {} by conn {}", name, conn);

        out.push(Outbound::Send(
            conn,
            ControlMessage::Created {
                name: name.clone(),
                multi: true,
            },
        ));

        for waiter in self.waiters.remove(&name).unwrap_or_default() {
            self.attach_hub_peer(&name, waiter.conn, out);
        }
    }

    fn join(&mut self, conn: ConnId, name: String, now: Instant, out: &mut Vec<Outbound>) {
        let existing = self
            .rooms
            .get(&name)
            .map(|room| (room.owner == conn, room.is_hub()));

        match existing {
            Some((true, _)) => {
                out.push(Outbound::Send(
                    conn,
                    ControlMessage::error(ErrorCode::UnexpectedMessage),
                ));
            }
            Some((false, true)) => self.attach_hub_peer(&name, conn, out),
            Some((false, false)) => self.offer_to(&name, conn, out),
            None => {
                let waiting = self.waiters.entry(name.clone()).or_default();
                if !waiting.iter().any(|w| w.conn == conn) {
                    debug!("conn {} waiting for room {}", conn, name);
                    waiting.push(Waiter {
                        conn,
                        deadline: now + self.config.join_wait(),
                    });
                }
            }
        }
    }

    /// Hand a single-peer room's offer (and buffered candidates) to a joiner
    fn offer_to(&mut self, name: &str, conn: ConnId, out: &mut Vec<Outbound>) {
        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        let RoomMode::Single {
            offer,
            candidates,
            offered,
        } = &mut room.mode
        else {
            return;
        };

        if !offered.contains(&conn) {
            offered.push(conn);
        }

        out.push(Outbound::Send(
            conn,
            ControlMessage::Offer {
                name: name.to_string(),
                sdp: offer.clone(),
                peer_id: None,
            },
        ));
        out.extend(
            candidates
                .iter()
                .map(|candidate| Outbound::Send(conn, candidate.clone())),
        );
    }

    /// Attach a joiner to a hub room and ask the owner for an offer
    fn attach_hub_peer(&mut self, name: &str, conn: ConnId, out: &mut Vec<Outbound>) {
        let fresh_id = self.generate_peer_id();
        let Some(room) = self.rooms.get_mut(name) else {
            return;
        };
        let owner = room.owner;
        let RoomMode::Hub { peers } = &mut room.mode else {
            return;
        };

        if let Some(peer) = peers.values().find(|peer| peer.conn == conn) {
            // Repeated join: replay the offer if the hub already produced one
            if let Some(sdp) = &peer.offer {
                out.push(Outbound::Send(
                    conn,
                    ControlMessage::Offer {
                        name: name.to_string(),
                        sdp: sdp.clone(),
                        peer_id: None,
                    },
                ));
            }
            return;
        }

        peers.insert(fresh_id.clone(), HubPeer { conn, offer: None });
        self.hub_members.insert(conn, name.to_string());
        debug!("conn {} joined hub {} as {}", conn, name, fresh_id);

        out.push(Outbound::Send(
            owner,
            ControlMessage::JoinRequest {
                name: name.to_string(),
                peer_id: fresh_id,
            },
        ));
    }

    fn relay_offer(
        &mut self,
        conn: ConnId,
        name: String,
        sdp: String,
        peer_id: Option<String>,
        out: &mut Vec<Outbound>,
    ) {
        // Hub owner addressing one of its joiners
        if let Some(pid) = peer_id {
            match self.hub_peer_mut(conn, &name, &pid) {
                Ok(peer) => {
                    peer.offer = Some(sdp.clone());
                    let target = peer.conn;
                    out.push(Outbound::Send(
                        target,
                        ControlMessage::Offer {
                            name,
                            sdp,
                            peer_id: None,
                        },
                    ));
                }
                Err(code) => out.push(Outbound::Send(conn, ControlMessage::error(code))),
            }
            return;
        }

        let msg = ControlMessage::Offer {
            name: name.clone(),
            sdp,
            peer_id: None,
        };

        if let Some(partner) = self.partner_of(conn) {
            out.push(Outbound::Send(partner, msg));
        } else if let Some((owner, pid)) = self.hub_owner_for_member(conn, &name) {
            out.push(Outbound::Send(owner, msg.with_peer_id(Some(pid))));
        } else {
            out.push(Outbound::Send(conn, ControlMessage::error(ErrorCode::NotPaired)));
        }
    }

    fn relay_answer(
        &mut self,
        conn: ConnId,
        name: String,
        sdp: String,
        peer_id: Option<String>,
        out: &mut Vec<Outbound>,
    ) {
        let answer = ControlMessage::Answer {
            name: name.clone(),
            sdp,
            peer_id: None,
        };

        // Completes a pending single-peer handshake, but only for a joiner
        // that was actually handed the offer
        let pending_owner = self
            .rooms
            .get(&name)
            .filter(|room| {
                matches!(&room.mode, RoomMode::Single { offered, .. } if offered.contains(&conn))
            })
            .map(|room| room.owner);
        if let Some(owner) = pending_owner {
            self.rooms.remove(&name);
            self.owners.remove(&owner);
            self.link(owner, conn);
            info!("Room {} matched (conn {} <-> conn {}), removed", name, owner, conn);

            out.push(Outbound::Send(owner, answer));
            out.push(Outbound::Send(conn, ControlMessage::Ack));
            return;
        }

        // Hub joiner answering the hub
        if let Some((owner, pid)) = self.hub_owner_for_member(conn, &name) {
            out.push(Outbound::Send(owner, answer.with_peer_id(Some(pid))));
            out.push(Outbound::Send(conn, ControlMessage::Ack));
            return;
        }

        // Hub answering a joiner's restart offer
        if let Some(pid) = peer_id {
            match self.hub_peer_mut(conn, &name, &pid) {
                Ok(peer) => {
                    let target = peer.conn;
                    out.push(Outbound::Send(target, answer));
                    out.push(Outbound::Send(conn, ControlMessage::Ack));
                }
                Err(code) => out.push(Outbound::Send(conn, ControlMessage::error(code))),
            }
            return;
        }

        if let Some(partner) = self.partner_of(conn) {
            out.push(Outbound::Send(partner, answer));
            out.push(Outbound::Send(conn, ControlMessage::Ack));
            return;
        }

        out.push(Outbound::Send(conn, ControlMessage::error(ErrorCode::RoomNotFound)));
    }

    fn relay_candidate(&mut self, conn: ConnId, msg: ControlMessage, out: &mut Vec<Outbound>) {
        let name = msg.room_name().unwrap_or_default().to_string();
        let peer_id = msg.peer_id().map(str::to_string);
        let relay = msg.with_peer_id(None);

        if let Some(partner) = self.partner_of(conn) {
            out.push(Outbound::Send(partner, relay));
            return;
        }

        let max_buffered = self.config.max_buffered_candidates;
        if let Some(room) = self.rooms.get_mut(&name) {
            if room.owner == conn {
                match &mut room.mode {
                    RoomMode::Single {
                        candidates,
                        offered,
                        ..
                    } => {
                        if candidates.len() < max_buffered {
                            candidates.push(relay.clone());
                        }
                        out.extend(offered.iter().map(|c| Outbound::Send(*c, relay.clone())));
                    }
                    RoomMode::Hub { peers } => {
                        match peer_id.as_deref().and_then(|pid| peers.get(pid)) {
                            Some(peer) => out.push(Outbound::Send(peer.conn, relay)),
                            None => debug!("Dropping hub candidate for unknown peer in {}", name),
                        }
                    }
                }
                return;
            }

            if let RoomMode::Single { offered, .. } = &room.mode {
                if offered.contains(&conn) {
                    out.push(Outbound::Send(room.owner, relay));
                    return;
                }
            }
        }

        if let Some((owner, pid)) = self.hub_owner_for_member(conn, &name) {
            out.push(Outbound::Send(owner, relay.with_peer_id(Some(pid))));
            return;
        }

        debug!("Dropping candidate from conn {} for {}: no route", conn, name);
    }

    /// A connection closed: drop everything it owned or waited on.
    /// Hub owners are told which of their joiners left.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Outbound> {
        let mut out = Vec::new();
        self.release_owned(conn);

        self.waiters.retain(|_, waiting| {
            waiting.retain(|w| w.conn != conn);
            !waiting.is_empty()
        });

        if let Some(name) = self.hub_members.remove(&conn) {
            if let Some(room) = self.rooms.get_mut(&name) {
                let owner = room.owner;
                if let RoomMode::Hub { peers } = &mut room.mode {
                    let left: Vec<String> = peers
                        .iter()
                        .filter(|(_, peer)| peer.conn == conn)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for peer_id in left {
                        peers.remove(&peer_id);
                        debug!("Hub {} peer {} left (conn {})", name, peer_id, conn);
                        out.push(Outbound::Send(
                            owner,
                            ControlMessage::PeerLeft {
                                name: name.clone(),
                                peer_id,
                            },
                        ));
                    }
                }
            }
        }

        for room in self.rooms.values_mut() {
            if let RoomMode::Single { offered, .. } = &mut room.mode {
                offered.retain(|c| *c != conn);
            }
        }

        if let Some(partner) = self.links.remove(&conn) {
            self.links.remove(&partner);
        }

        out
    }

    /// Fire join waits and room TTLs that are due
    pub fn expire(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        self.waiters.retain(|name, waiting| {
            waiting.retain(|w| {
                if now >= w.deadline {
                    debug!("Join wait for {} elapsed (conn {})", name, w.conn);
                    out.push(Outbound::Send(
                        w.conn,
                        ControlMessage::NotFound { name: name.clone() },
                    ));
                    false
                } else {
                    true
                }
            });
            !waiting.is_empty()
        });

        let expired: Vec<String> = self
            .rooms
            .values()
            .filter(|room| room.is_expired(now))
            .map(|room| room.name.clone())
            .collect();

        for name in expired {
            if let Some(room) = self.rooms.remove(&name) {
                self.owners.remove(&room.owner);
                info!("Room {} removed (ttl expired)", name);
                out.push(Outbound::Send(
                    room.owner,
                    ControlMessage::error(ErrorCode::RoomExpired),
                ));
                out.push(Outbound::Close(room.owner));
            }
        }

        out
    }

    /// Delete the room `conn` owns, if any
    fn release_owned(&mut self, conn: ConnId) {
        let Some(name) = self.owners.remove(&conn) else {
            return;
        };
        if let Some(room) = self.rooms.remove(&name) {
            if let RoomMode::Hub { peers } = &room.mode {
                for peer in peers.values() {
                    self.hub_members.remove(&peer.conn);
                }
            }
            info!("Room {} removed (owner released)", name);
        }
    }

    fn link(&mut self, a: ConnId, b: ConnId) {
        for conn in [a, b] {
            if let Some(old) = self.links.remove(&conn) {
                self.links.remove(&old);
            }
        }
        self.links.insert(a, b);
        self.links.insert(b, a);
    }

    /// Hub peer `pid` in room `name`, provided `owner` owns that hub
    fn hub_peer_mut(
        &mut self,
        owner: ConnId,
        name: &str,
        pid: &str,
    ) -> Result<&mut HubPeer, ErrorCode> {
        let room = self
            .rooms
            .get_mut(name)
            .filter(|room| room.owner == owner)
            .ok_or(ErrorCode::RoomNotFound)?;
        match &mut room.mode {
            RoomMode::Hub { peers } => peers.get_mut(pid).ok_or(ErrorCode::UnknownPeer),
            RoomMode::Single { .. } => Err(ErrorCode::UnknownPeer),
        }
    }

    /// Owner and peer id for a hub joiner connection
    fn hub_owner_for_member(&self, conn: ConnId, name: &str) -> Option<(ConnId, String)> {
        if self.hub_members.get(&conn).map(String::as_str) != Some(name) {
            return None;
        }
        let room = self.rooms.get(name)?;
        let pid = room.hub_peer_for(conn)?;
        Some((room.owner, pid.to_string()))
    }

    fn generate_peer_id(&mut self) -> String {
        let mut bytes = [0u8; 8];
        match getrandom::fill(&mut bytes) {
            Ok(()) => hex::encode(bytes),
            Err(_) => {
                self.peer_seq += 1;
                format!("{:016x}", self.peer_seq)
            }
        }
    }
}
