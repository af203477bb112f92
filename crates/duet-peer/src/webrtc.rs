//! WebRTC transport backend
//!
//! One `RTCPeerConnection` with a single ordered text data channel. The
//! creator opens the channel, the joiner receives it. Callbacks only push
//! [`TransportEvent`]s onto the session's channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use duet_core::{IceCandidate, Role, TransportConfig, TransportError, TransportState};

use crate::transport::{EventSender, Transport, TransportEvent, TransportFactory};

type SharedChannel = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// WebRTC peer connection with one data channel
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: SharedChannel,
    /// Remote candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<IceCandidate>>,
}

impl WebRtcTransport {
    pub async fn new(
        config: &TransportConfig,
        role: Role,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let mut rtc_config = RTCConfiguration::default();
        if !config.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(backend)?);
        let channel: SharedChannel = Arc::new(Mutex::new(None));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state: {}", state);
            if let Some(state) = map_peer_state(state) {
                let _ = tx.send(TransportEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(state) = map_ice_state(state) {
                let _ = tx.send(TransportEvent::IceState(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            // None marks the end of gathering
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        if role.is_initiator() {
            let dc = pc
                .create_data_channel(&config.channel_label, Some(RTCDataChannelInit::default()))
                .await
                .map_err(backend)?;
            attach_channel(&dc, &events);
            *channel.lock() = Some(dc);
        } else {
            let slot = channel.clone();
            let tx = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                debug!("Remote data channel '{}'", dc.label());
                attach_channel(&dc, &tx);
                // Already open by the time the callback runs in some cases
                if dc.ready_state() == RTCDataChannelState::Open {
                    let _ = tx.send(TransportEvent::ChannelOpen);
                }
                *slot.lock() = Some(dc);
                Box::pin(async {})
            }));
        }

        Ok(Self {
            pc,
            channel,
            pending_candidates: Mutex::new(Vec::new()),
        })
    }

    async fn flush_pending_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate_init(candidate)).await {
                warn!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.lock().clone()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(negotiation)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        // Our own unanswered offer crossed this one; drop it and answer instead
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            if let Some(mut pending) = self.pc.pending_local_description().await {
                debug!("Rolling back local offer to accept the remote one");
                pending.sdp_type = RTCSdpType::Rollback;
                self.pc.set_local_description(pending).await.map_err(negotiation)?;
            }
        }

        let offer = RTCSessionDescription::offer(sdp).map_err(negotiation)?;
        self.pc.set_remote_description(offer).await.map_err(negotiation)?;
        self.flush_pending_candidates().await;

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(negotiation)?;
        Ok(sdp)
    }

    async fn accept_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(negotiation)?;
        self.pc.set_remote_description(answer).await.map_err(negotiation)?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            debug!("Buffering remote candidate until the remote description is set");
            self.pending_candidates.lock().push(candidate);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(candidate_init(candidate))
            .await
            .map_err(backend)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let dc = self
            .data_channel()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .ok_or(TransportError::ChannelNotOpen)?;
        dc.send_text(text.to_string()).await.map_err(backend)?;
        Ok(())
    }

    fn channel_open(&self) -> bool {
        self.data_channel()
            .is_some_and(|dc| dc.ready_state() == RTCDataChannelState::Open)
    }

    async fn close(&self) {
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("Data channel close: {}", e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Peer connection close: {}", e);
        }
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: &EventSender) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => {
                let _ = tx.send(TransportEvent::ChannelMessage(text));
            }
            Err(_) => warn!("Dropping non UTF-8 data channel message"),
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelClosed);
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let _ = tx.send(TransportEvent::ChannelError(err.to_string()));
        Box::pin(async {})
    }));
}

fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Checking),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<TransportState> {
    match state {
        RTCIceConnectionState::New => Some(TransportState::New),
        RTCIceConnectionState::Checking => Some(TransportState::Checking),
        RTCIceConnectionState::Connected => Some(TransportState::Connected),
        RTCIceConnectionState::Completed => Some(TransportState::Completed),
        RTCIceConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCIceConnectionState::Failed => Some(TransportState::Failed),
        RTCIceConnectionState::Closed => Some(TransportState::Closed),
        RTCIceConnectionState::Unspecified => None,
    }
}

fn backend(e: webrtc::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn negotiation(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Builds [`WebRtcTransport`]s from the `[transport]` config section
pub struct WebRtcFactory {
    config: TransportConfig,
}

impl WebRtcFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        role: Role,
        events: EventSender,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let transport = WebRtcTransport::new(&self.config, role, events).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Connecting),
            Some(TransportState::Checking)
        );
        assert_eq!(map_peer_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            Some(TransportState::Completed)
        );
        assert!(map_ice_state(RTCIceConnectionState::Disconnected)
            .is_some_and(TransportState::is_degraded));
    }

    #[test]
    fn test_candidate_init_keeps_fields() {
        let init = candidate_init(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        });
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(init.sdp_mline_index, Some(0));
        assert!(init.username_fragment.is_none());
    }

    async fn local_pair() -> (WebRtcTransport, WebRtcTransport) {
        let config = TransportConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        let (creator_tx, _creator_rx) = tokio::sync::mpsc::unbounded_channel();
        let (joiner_tx, _joiner_rx) = tokio::sync::mpsc::unbounded_channel();
        let creator = WebRtcTransport::new(&config, Role::Creator, creator_tx)
            .await
            .unwrap();
        let joiner = WebRtcTransport::new(&config, Role::Joiner, joiner_tx)
            .await
            .unwrap();
        (creator, joiner)
    }

    #[tokio::test]
    async fn test_crossed_restart_offers_resolve() {
        let (creator, joiner) = local_pair().await;
        let offer = creator.create_offer(false).await.unwrap();
        let answer = joiner.accept_offer(offer).await.unwrap();
        creator.accept_answer(answer).await.unwrap();

        // Both restart at once; the joiner drops its offer and answers
        let _ignored = joiner.create_offer(true).await.unwrap();
        let restart = creator.create_offer(true).await.unwrap();
        assert_eq!(joiner.pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        let answer = joiner.accept_offer(restart).await.unwrap();
        creator.accept_answer(answer).await.unwrap();
        assert_eq!(creator.pc.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(joiner.pc.signaling_state(), RTCSignalingState::Stable);

        creator.close().await;
        joiner.close().await;
    }
}
