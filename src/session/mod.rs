//! Peer session control
//!
//! A session drives one peer connection from negotiation to teardown:
//! - descriptor exchange through a [`Signaling`] implementation
//! - state tracking from the peer's event queue
//! - address lease delivery over the `control` channel
//!
//! Every peer event is consumed in order by [`Session::next`], so state only
//! ever changes on the caller's task.

mod allocator;
mod signaling;

pub use allocator::{AllocError, IpAllocator, Lease, LeasePool};
pub use signaling::{ChannelSignaling, ConsoleSignaling, Signaling};

use crate::obfuscation::FrameTransform;
use crate::protocol::{
    ControlMessage, DescriptorKind, ProtocolError, SessionDescriptor, CONTROL_CHANNEL_LABEL,
    DATA_CHANNEL_LABEL,
};
use crate::transport::{PeerConnection, PeerEvent, PeerEvents, PeerState, TransportError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling failed: {0}")]
    Signaling(String),

    #[error("Peer connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Address allocation failed: {0}")]
    Allocation(#[from] AllocError),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Which end of the negotiation this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Offers, allocates addresses
    Server,
    /// Answers, receives a lease
    Client,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Ready,
    Closed,
    Failed,
}

impl SessionState {
    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Negotiating)
                | (Created, Closed)
                | (Negotiating, Ready)
                | (Negotiating, Failed)
                | (Negotiating, Closed)
                | (Ready, Failed)
                | (Ready, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Something the session owner must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    /// The peer connection is up
    Ready,
    /// The `data` channel opened
    DataChannelOpen,
    /// Server: a lease was delivered to the client
    LeaseIssued(Lease),
    /// Client: the server assigned this lease
    LeaseReceived(Lease),
    /// An obfuscated frame arrived on the `data` channel
    Data(Bytes),
    /// The connection was closed
    Closed,
}

/// One peer session
pub struct Session {
    role: Role,
    state: SessionState,
    peer: Arc<dyn PeerConnection>,
    events: PeerEvents,
    transform: Arc<FrameTransform>,
    leases: Option<Arc<LeasePool>>,
    lease: Option<Lease>,
    lease_delivered: bool,
    control_open: bool,
    pending: VecDeque<Result<SessionOutput, SessionError>>,
}

impl Session {
    /// Offering side; leases come from `leases`
    pub fn server(
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        transform: Arc<FrameTransform>,
        leases: Arc<LeasePool>,
    ) -> Self {
        Self::new(Role::Server, peer, events, transform, Some(leases))
    }

    /// Answering side
    pub fn client(
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        transform: Arc<FrameTransform>,
    ) -> Self {
        Self::new(Role::Client, peer, events, transform, None)
    }

    fn new(
        role: Role,
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        transform: Arc<FrameTransform>,
        leases: Option<Arc<LeasePool>>,
    ) -> Self {
        Self {
            role,
            state: SessionState::Created,
            peer,
            events,
            transform,
            leases,
            lease: None,
            lease_delivered: false,
            control_open: false,
            pending: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The lease issued (server) or received (client), once there is one
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_become(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        error!("Session failed: {}", err);
        if self.state.can_become(SessionState::Failed) {
            self.state = SessionState::Failed;
        }
        err
    }

    /// Exchange descriptors with the other side. The connection comes up
    /// asynchronously afterwards; watch [`next`](Self::next) for `Ready`.
    pub async fn negotiate(&mut self, signaling: &mut dyn Signaling) -> Result<(), SessionError> {
        self.transition(SessionState::Negotiating)?;
        info!("Negotiating peer session as {:?}", self.role);

        let result = match self.role {
            Role::Server => self.negotiate_offer(signaling).await,
            Role::Client => self.negotiate_answer(signaling).await,
        };
        result.map_err(|e| self.fail(e))
    }

    async fn negotiate_offer(&self, signaling: &mut dyn Signaling) -> Result<(), SessionError> {
        let offer = self
            .peer
            .create_offer()
            .await
            .map_err(|e| SessionError::Negotiation(e.to_string()))?;
        signaling
            .publish(&self.transform.encode_descriptor(&offer)?)
            .await?;

        let answer = self.read_remote(signaling, DescriptorKind::Answer).await?;
        self.peer
            .apply_answer(answer)
            .await
            .map_err(|e| SessionError::Negotiation(e.to_string()))
    }

    async fn negotiate_answer(&self, signaling: &mut dyn Signaling) -> Result<(), SessionError> {
        let offer = self.read_remote(signaling, DescriptorKind::Offer).await?;
        let answer = self
            .peer
            .accept_offer(offer)
            .await
            .map_err(|e| SessionError::Negotiation(e.to_string()))?;
        signaling
            .publish(&self.transform.encode_descriptor(&answer)?)
            .await
    }

    async fn read_remote(
        &self,
        signaling: &mut dyn Signaling,
        expected: DescriptorKind,
    ) -> Result<SessionDescriptor, SessionError> {
        let text = signaling.await_remote().await?;
        let desc = self.transform.decode_descriptor(&text)?;
        if desc.kind != expected {
            return Err(ProtocolError::UnexpectedDescriptor {
                expected,
                actual: desc.kind,
            }
            .into());
        }
        Ok(desc)
    }

    /// Next thing the owner must act on. Errors are fatal to the session.
    /// Returns `None` once the session has ended and everything was drained.
    pub async fn next(&mut self) -> Option<Result<SessionOutput, SessionError>> {
        loop {
            if let Some(output) = self.pending.pop_front() {
                return Some(output);
            }
            if self.state.is_terminal() {
                return None;
            }

            match self.events.recv().await {
                Some(event) => self.handle(event).await,
                None => {
                    info!("Peer event queue closed");
                    self.state = SessionState::Closed;
                    return Some(Ok(SessionOutput::Closed));
                }
            }
        }
    }

    async fn handle(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::StateChanged(state) => self.on_state(state).await,
            PeerEvent::ChannelOpen(label) => {
                info!("Channel '{}' open", label);
                if label == DATA_CHANNEL_LABEL {
                    self.pending.push_back(Ok(SessionOutput::DataChannelOpen));
                } else if label == CONTROL_CHANNEL_LABEL {
                    self.control_open = true;
                    self.deliver_lease().await;
                }
            }
            PeerEvent::ChannelClosed(label) => {
                debug!("Channel '{}' closed", label);
                if label == CONTROL_CHANNEL_LABEL {
                    self.control_open = false;
                }
            }
            PeerEvent::Message { label, data } => {
                if label == DATA_CHANNEL_LABEL {
                    self.pending.push_back(Ok(SessionOutput::Data(data)));
                } else if label == CONTROL_CHANNEL_LABEL {
                    self.on_control(&data);
                } else {
                    debug!("Message on unknown channel '{}' ignored", label);
                }
            }
        }
    }

    async fn on_state(&mut self, state: PeerState) {
        info!("Peer connection state: {:?}", state);
        match state {
            PeerState::Connected => {
                if self.transition(SessionState::Ready).is_ok() {
                    self.pending.push_back(Ok(SessionOutput::Ready));
                    self.deliver_lease().await;
                }
            }
            PeerState::Failed => {
                if self.state.can_become(SessionState::Failed) {
                    let err = self.fail(SessionError::ConnectionFailed(
                        "peer connection failed".to_string(),
                    ));
                    self.pending.push_back(Err(err));
                }
            }
            PeerState::Closed => {
                if self.transition(SessionState::Closed).is_ok() {
                    self.pending.push_back(Ok(SessionOutput::Closed));
                }
            }
            PeerState::Disconnected => warn!("Peer disconnected"),
            PeerState::New | PeerState::Connecting => {}
        }
    }

    /// Server: send the lease once the session is ready and `control` is open
    async fn deliver_lease(&mut self) {
        if self.role != Role::Server
            || self.state != SessionState::Ready
            || !self.control_open
            || self.lease_delivered
        {
            return;
        }

        let lease = match self.lease {
            Some(lease) => lease,
            None => {
                let issued = match &self.leases {
                    Some(pool) => pool.issue(),
                    None => return,
                };
                match issued {
                    Ok(lease) => {
                        self.lease = Some(lease);
                        lease
                    }
                    Err(e) => {
                        let err = self.fail(e.into());
                        self.pending.push_back(Err(err));
                        return;
                    }
                }
            }
        };

        let encoded = match ControlMessage::IpAllocate(lease.to_message()).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode lease: {}", e);
                return;
            }
        };

        match self.peer.send(CONTROL_CHANNEL_LABEL, &encoded).await {
            Ok(()) => {
                info!(
                    "Sent lease to client: {} (gateway {}, block {})",
                    lease.client, lease.gateway, lease.block
                );
                self.lease_delivered = true;
                self.pending.push_back(Ok(SessionOutput::LeaseIssued(lease)));
            }
            // Kept for the next time the control channel opens
            Err(e) => warn!("Failed to send lease: {}", e),
        }
    }

    /// Client: act on a control message
    fn on_control(&mut self, data: &[u8]) {
        let msg = match ControlMessage::decode(data) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("Ignoring unknown control message");
                return;
            }
            Err(e) => {
                warn!("Dropping malformed control message: {}", e);
                return;
            }
        };

        match msg {
            ControlMessage::IpAllocate(allocation) => {
                if self.role != Role::Client {
                    debug!("Ignoring lease sent to the server");
                    return;
                }
                if self.lease.is_some() {
                    debug!("Ignoring duplicate lease");
                    return;
                }
                match Lease::from_message(&allocation) {
                    Some(lease) => {
                        info!(
                            "Received lease: {} (gateway {}, block {})",
                            lease.client, lease.gateway, lease.block
                        );
                        self.lease = Some(lease);
                        self.pending
                            .push_back(Ok(SessionOutput::LeaseReceived(lease)));
                    }
                    None => warn!("Dropping lease with unparsable addresses: {:?}", allocation),
                }
            }
        }
    }

    /// Close the peer connection
    pub async fn close(&mut self) {
        self.peer.close().await;
        if self.state.can_become(SessionState::Closed) {
            self.state = SessionState::Closed;
        }
    }
}
