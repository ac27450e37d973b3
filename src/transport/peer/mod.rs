//! Peer data-channel transport
//!
//! A peer connection is negotiated once per run through an offer/answer
//! exchange and then carries two labelled channels: `data` for frames and
//! `control` for session messages. Backends never call into the session
//! directly; everything they observe is pushed as a [`PeerEvent`] onto one
//! queue that the session consumes in order.

mod loopback;
#[cfg(feature = "webrtc")]
mod rtc;

pub use loopback::LoopbackPeer;
#[cfg(feature = "webrtc")]
pub use rtc::{RtcPeer, RtcPeerConfig};

use super::{Channel, TransportError};
use crate::protocol::SessionDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state reported by a peer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something a peer backend observed
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged(PeerState),
    ChannelOpen(String),
    ChannelClosed(String),
    Message { label: String, data: Bytes },
}

/// Event queue handed out alongside a peer connection
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// A negotiated peer-to-peer connection with labelled channels
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce the local offer (offering side)
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError>;

    /// Apply a remote offer and produce the answer (answering side)
    async fn accept_offer(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, TransportError>;

    /// Apply the remote answer (offering side)
    async fn apply_answer(&self, answer: SessionDescriptor) -> Result<(), TransportError>;

    /// Send on a labelled channel. Fails with `NotReady` instead of waiting
    /// when the channel is not open.
    async fn send(&self, label: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Whether the labelled channel is open
    fn is_open(&self, label: &str) -> bool;

    /// Tear the connection down
    async fn close(&self);
}

/// [`Channel`] view of one label on a peer connection.
///
/// Closing the handle detaches it; the connection itself belongs to the
/// session and outlives individual handles.
pub struct PeerChannel {
    peer: Arc<dyn PeerConnection>,
    label: String,
    name: String,
    closed: AtomicBool,
}

impl PeerChannel {
    pub fn new(peer: Arc<dyn PeerConnection>, label: &str) -> Self {
        Self {
            peer,
            label: label.to_string(),
            name: format!("peer:{}", label),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Channel for PeerChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.peer.is_open(&self.label) {
            return Err(TransportError::NotReady);
        }
        self.peer.send(&self.label, data).await
    }

    fn is_ready(&self) -> bool {
        !self.is_closed() && self.peer.is_open(&self.label)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn peer(&self) -> &str {
        &self.name
    }
}
