//! Transport layer implementations
//!
//! Provides interchangeable carriers for obfuscated frames:
//! - UDP (one shared socket, connectionless)
//! - WebSocket (`ws`/`wss`, one connection per flow)
//! - Peer data channels negotiated out-of-band (feature `webrtc` for the
//!   real backend, in-process loopback for tests and embedding)

mod peer;
mod udp;
mod ws;

pub use peer::{
    LoopbackPeer, PeerChannel, PeerConnection, PeerEvent, PeerState, PeerEvents,
};
#[cfg(feature = "webrtc")]
pub use peer::{RtcPeer, RtcPeerConfig};
pub use udp::{UdpChannel, UdpDialer, UdpReceiver};
pub use ws::{accept as accept_ws, WsChannel, WsDialer, WsReceiver, WsSettings};

use crate::protocol::FlowKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Channel not ready")]
    NotReady,

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// Whether the channel that produced this error can never carry traffic again
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Closed
                | TransportError::ConnectionFailed(_)
                | TransportError::WebSocket(_)
        )
    }
}

/// Sending half of an established transport session.
///
/// Channels are shared between the egress loop and the flow table, so every
/// method takes `&self`.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one already-obfuscated frame
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Whether `send` may be attempted right now
    fn is_ready(&self) -> bool;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// Release transport resources. Calling it more than once has no effect.
    async fn close(&self);

    /// Human readable remote endpoint, also used to tell channels apart
    fn peer(&self) -> &str;
}

/// Shared channel handle
pub type ChannelRef = Arc<dyn Channel>;

/// Receiving half of an established transport session
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Next inbound frame, or `None` once the session has ended
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// A freshly dialed transport session
pub struct Dialed {
    pub channel: ChannelRef,
    /// `None` when inbound traffic is read elsewhere (e.g. a shared UDP socket)
    pub receiver: Option<Box<dyn ChannelReceiver>>,
}

/// Establishes a transport session for a flow
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, key: &FlowKey) -> Result<Dialed, TransportError>;
}
