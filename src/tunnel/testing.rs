//! Test doubles for the tunnel layer

use crate::transport::{Channel, ChannelRef, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Channel that records what is sent and how often it is closed
pub struct MockChannel {
    label: String,
    ready: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    fail_with_closed: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MockChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            ready: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            fail_with_closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> ChannelRef {
        Arc::clone(self) as ChannelRef
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Make every following send fail with `Closed`
    pub fn break_link(&self) {
        self.fail_with_closed.store(true, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_with_closed.load(Ordering::SeqCst) || self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn peer(&self) -> &str {
        &self.label
    }
}
