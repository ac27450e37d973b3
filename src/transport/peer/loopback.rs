//! In-process peer connection
//!
//! Two [`LoopbackPeer`]s share a link. Negotiation follows the real
//! offer/answer order, and the channels only open once the offering side has
//! applied the answer, so callers see the same readiness gating as with a
//! network backend.

use super::{PeerConnection, PeerEvent, PeerEvents, PeerState};
use crate::protocol::{DescriptorKind, SessionDescriptor, CONTROL_CHANNEL_LABEL, DATA_CHANNEL_LABEL};
use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

struct Link {
    id: u64,
    events: [mpsc::UnboundedSender<PeerEvent>; 2],
    offered: AtomicBool,
    answered: AtomicBool,
    connected: AtomicBool,
}

impl Link {
    fn emit(&self, side: usize, event: PeerEvent) {
        let _ = self.events[side].send(event);
    }

    fn emit_both(&self, event: PeerEvent) {
        self.emit(0, event.clone());
        self.emit(1, event);
    }
}

/// One end of an in-process peer link
pub struct LoopbackPeer {
    side: usize,
    link: Arc<Link>,
}

impl LoopbackPeer {
    /// Create both ends of a link, each with its event queue
    pub fn pair() -> ((LoopbackPeer, PeerEvents), (LoopbackPeer, PeerEvents)) {
        let (tx0, rx0) = mpsc::unbounded_channel();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            events: [tx0, tx1],
            offered: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        });

        (
            (
                LoopbackPeer {
                    side: 0,
                    link: Arc::clone(&link),
                },
                rx0,
            ),
            (LoopbackPeer { side: 1, link }, rx1),
        )
    }

    /// Simulate a connectivity failure observed by both ends
    pub fn fail(&self) {
        self.link.connected.store(false, Ordering::Release);
        self.link
            .emit_both(PeerEvent::StateChanged(PeerState::Failed));
    }

    fn other(&self) -> usize {
        1 - self.side
    }

    fn connect(&self) {
        let link = &self.link;
        link.emit_both(PeerEvent::StateChanged(PeerState::Connecting));
        link.connected.store(true, Ordering::Release);
        link.emit_both(PeerEvent::StateChanged(PeerState::Connected));
        for label in [DATA_CHANNEL_LABEL, CONTROL_CHANNEL_LABEL] {
            link.emit_both(PeerEvent::ChannelOpen(label.to_string()));
        }
    }
}

fn expect_kind(desc: &SessionDescriptor, kind: DescriptorKind) -> Result<(), TransportError> {
    if desc.kind != kind {
        return Err(TransportError::Peer(format!(
            "expected {}, got {}",
            kind, desc.kind
        )));
    }
    Ok(())
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_offer(&self) -> Result<SessionDescriptor, TransportError> {
        self.link.offered.store(true, Ordering::Release);
        Ok(SessionDescriptor::offer(format!(
            "loopback link={} side={}",
            self.link.id, self.side
        )))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescriptor,
    ) -> Result<SessionDescriptor, TransportError> {
        expect_kind(&offer, DescriptorKind::Offer)?;
        if !self.link.offered.load(Ordering::Acquire) {
            return Err(TransportError::Peer("no offer outstanding".to_string()));
        }
        self.link.answered.store(true, Ordering::Release);
        Ok(SessionDescriptor::answer(format!(
            "loopback link={} side={}",
            self.link.id, self.side
        )))
    }

    async fn apply_answer(&self, answer: SessionDescriptor) -> Result<(), TransportError> {
        expect_kind(&answer, DescriptorKind::Answer)?;
        if !self.link.answered.load(Ordering::Acquire) {
            return Err(TransportError::Peer("answer without offer".to_string()));
        }
        self.connect();
        Ok(())
    }

    async fn send(&self, label: &str, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_open(label) {
            return Err(TransportError::NotReady);
        }
        self.link.events[self.other()]
            .send(PeerEvent::Message {
                label: label.to_string(),
                data: Bytes::copy_from_slice(data),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self, label: &str) -> bool {
        self.link.connected.load(Ordering::Acquire)
            && (label == DATA_CHANNEL_LABEL || label == CONTROL_CHANNEL_LABEL)
    }

    async fn close(&self) {
        if self.link.connected.swap(false, Ordering::AcqRel) {
            for label in [DATA_CHANNEL_LABEL, CONTROL_CHANNEL_LABEL] {
                self.link
                    .emit_both(PeerEvent::ChannelClosed(label.to_string()));
            }
        }
        self.link
            .emit(self.side, PeerEvent::StateChanged(PeerState::Closed));
        self.link
            .emit(self.other(), PeerEvent::StateChanged(PeerState::Disconnected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiation_opens_channels() {
        let ((a, mut a_events), (b, mut b_events)) = LoopbackPeer::pair();

        assert!(!a.is_open(DATA_CHANNEL_LABEL));
        assert!(matches!(
            a.send(DATA_CHANNEL_LABEL, b"early").await,
            Err(TransportError::NotReady)
        ));

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.apply_answer(answer).await.unwrap();

        assert!(a.is_open(DATA_CHANNEL_LABEL));
        assert!(b.is_open(CONTROL_CHANNEL_LABEL));
        assert!(!b.is_open("other"));

        a.send(DATA_CHANNEL_LABEL, b"frame").await.unwrap();

        let mut saw_connected = false;
        while let Ok(event) = b_events.try_recv() {
            match event {
                PeerEvent::StateChanged(PeerState::Connected) => saw_connected = true,
                PeerEvent::Message { label, data } => {
                    assert!(saw_connected);
                    assert_eq!(label, DATA_CHANNEL_LABEL);
                    assert_eq!(&data[..], b"frame");
                }
                _ => {}
            }
        }
        assert!(saw_connected);
        assert!(a_events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_descriptor_kinds_enforced() {
        let ((a, _a_events), (b, _b_events)) = LoopbackPeer::pair();
        let offer = a.create_offer().await.unwrap();
        assert!(a.apply_answer(offer.clone()).await.is_err());
        let answer = b.accept_offer(offer).await.unwrap();
        assert!(b.accept_offer(answer).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_and_close() {
        let ((a, mut a_events), (b, _b_events)) = LoopbackPeer::pair();
        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.apply_answer(answer).await.unwrap();

        a.fail();
        assert!(!b.is_open(DATA_CHANNEL_LABEL));

        let mut failed = false;
        while let Ok(event) = a_events.try_recv() {
            if let PeerEvent::StateChanged(PeerState::Failed) = event {
                failed = true;
            }
        }
        assert!(failed);

        a.close().await;
        assert!(matches!(
            a_events.try_recv(),
            Ok(PeerEvent::StateChanged(PeerState::Closed))
        ));
    }
}
