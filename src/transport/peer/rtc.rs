//! WebRTC backend for the peer transport

use super::{PeerConnection, PeerEvent, PeerEvents, PeerState};
use crate::protocol::{DescriptorKind, SessionDescriptor, CONTROL_CHANNEL_LABEL, DATA_CHANNEL_LABEL};
use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Peer connection settings
#[derive(Debug, Clone)]
pub struct RtcPeerConfig {
    /// ICE servers, e.g. `stun:stun.l.google.com:19302`
    pub stun_servers: Vec<String>,
    /// Deliver messages in order
    pub ordered: bool,
    /// Give up on a message after this many milliseconds
    pub max_packet_lifetime_ms: u16,
}

type ChannelMap = Arc<RwLock<HashMap<String, Arc<RTCDataChannel>>>>;

/// Peer connection backed by the `webrtc` crate
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    channels: ChannelMap,
}

fn peer_err(e: webrtc::Error) -> TransportError {
    TransportError::Peer(e.to_string())
}

impl RtcPeer {
    /// Create a peer connection. The offering side creates the `data` and
    /// `control` channels; the answering side adopts them when they arrive.
    pub async fn new(
        config: &RtcPeerConfig,
        offerer: bool,
    ) -> Result<(Self, PeerEvents), TransportError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(peer_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(peer_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(peer_err)?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channels: ChannelMap = Arc::new(RwLock::new(HashMap::new()));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Peer connection state has changed: {}", state);
            let mapped = match state {
                RTCPeerConnectionState::New => PeerState::New,
                RTCPeerConnectionState::Connecting => PeerState::Connecting,
                RTCPeerConnectionState::Connected => PeerState::Connected,
                RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                RTCPeerConnectionState::Failed => PeerState::Failed,
                RTCPeerConnectionState::Closed => PeerState::Closed,
                _ => PeerState::New,
            };
            let _ = tx.send(PeerEvent::StateChanged(mapped));
            Box::pin(async {})
        }));

        if offerer {
            for label in [DATA_CHANNEL_LABEL, CONTROL_CHANNEL_LABEL] {
                let init = RTCDataChannelInit {
                    ordered: Some(config.ordered),
                    max_packet_life_time: Some(config.max_packet_lifetime_ms),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(label, Some(init))
                    .await
                    .map_err(peer_err)?;
                wire_channel(dc, &channels, &events_tx);
            }
        } else {
            let channels = Arc::clone(&channels);
            let tx = events_tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!("New data channel created: {}", dc.label());
                wire_channel(dc, &channels, &tx);
                Box::pin(async {})
            }));
        }

        Ok((Self { pc, channels }, events_rx))
    }

    async fn set_local_and_gather(
        &self,
        desc: RTCSessionDescription,
    ) -> Result<SessionDescriptor, TransportError> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await.map_err(peer_err)?;
        let _ = gathered.recv().await;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Peer("no local description".to_string()))?;
        let kind = match local.sdp_type {
            RTCSdpType::Answer => DescriptorKind::Answer,
            _ => DescriptorKind::Offer,
        };
        Ok(SessionDescriptor {
            kind,
            sdp: local.sdp,
        })
    }
}

fn wire_channel(
    dc: Arc<RTCDataChannel>,
    channels: &ChannelMap,
    events: &mpsc::UnboundedSender<PeerEvent>,
) {
    let label = dc.label().to_string();
    channels.write().insert(label.clone(), Arc::clone(&dc));

    let tx = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        debug!("Data channel '{}' open", open_label);
        let _ = tx.send(PeerEvent::ChannelOpen(open_label));
        Box::pin(async {})
    }));

    let tx = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::ChannelClosed(close_label.clone()));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(PeerEvent::Message {
            label: label.clone(),
            data: msg.data,
        });
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(peer_err)?;
        self.set_local_and_gather(offer).await
    }

    async fn accept_offer(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, TransportError> {
        if offer.kind != DescriptorKind::Offer {
            return Err(TransportError::Peer(format!("expected offer, got {}", offer.kind)));
        }
        let remote = RTCSessionDescription::offer(offer.sdp).map_err(peer_err)?;
        self.pc.set_remote_description(remote).await.map_err(peer_err)?;
        let answer = self.pc.create_answer(None).await.map_err(peer_err)?;
        self.set_local_and_gather(answer).await
    }

    async fn apply_answer(&self, answer: SessionDescriptor) -> Result<(), TransportError> {
        if answer.kind != DescriptorKind::Answer {
            return Err(TransportError::Peer(format!("expected answer, got {}", answer.kind)));
        }
        let remote = RTCSessionDescription::answer(answer.sdp).map_err(peer_err)?;
        self.pc.set_remote_description(remote).await.map_err(peer_err)
    }

    async fn send(&self, label: &str, data: &[u8]) -> Result<(), TransportError> {
        let dc = self
            .channels
            .read()
            .get(label)
            .cloned()
            .ok_or(TransportError::NotReady)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotReady);
        }
        dc.send(&Bytes::copy_from_slice(data)).await.map_err(peer_err)?;
        Ok(())
    }

    fn is_open(&self, label: &str) -> bool {
        self.channels
            .read()
            .get(label)
            .map(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .unwrap_or(false)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}
