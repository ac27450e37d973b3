//! Flow table
//!
//! Maps a [`FlowKey`] to the transport channel carrying that flow. Entries
//! idle for longer than the TTL are stale: lookups ignore them and the
//! sweeper removes them. Whenever an entry leaves the table its channel is
//! closed, unless another live entry still references the same channel.
//!
//! Resolution is single-flight. The map lock only guards slot lookup and
//! insertion; dialing happens outside it on the slot's `OnceCell`, so
//! concurrent first packets for one key share one dial while other keys
//! proceed independently.

use crate::protocol::FlowKey;
use crate::transport::{ChannelRef, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct FlowSlot {
    channel: OnceCell<ChannelRef>,
    last_active: Mutex<Instant>,
}

impl FlowSlot {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            channel: OnceCell::new(),
            last_active: Mutex::new(Instant::now()),
        })
    }

    fn with_channel(channel: ChannelRef) -> Arc<Self> {
        Arc::new(Self {
            channel: OnceCell::new_with(Some(channel)),
            last_active: Mutex::new(Instant::now()),
        })
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

fn same_channel(a: &ChannelRef, b: &ChannelRef) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Time-bounded mapping from flows to transport channels
pub struct FlowTable {
    entries: Mutex<HashMap<FlowKey, Arc<FlowSlot>>>,
    ttl: Duration,
}

impl FlowTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Idle time after which an entry is stale
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_stale(&self, slot: &FlowSlot) -> bool {
        match slot.channel.get() {
            Some(channel) => channel.is_closed() || slot.idle() > self.ttl,
            None => false,
        }
    }

    /// Return the live channel for `key`, or establish one with `open`.
    ///
    /// However many callers race on a new key, `open` runs once and every
    /// caller gets the same channel. A failed `open` leaves no entry behind.
    pub async fn resolve<F, Fut>(&self, key: FlowKey, open: F) -> Result<ChannelRef, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ChannelRef, TransportError>>,
    {
        let (slot, evicted) = {
            let mut entries = self.entries.lock();
            let evicted = if entries.get(&key).map_or(false, |slot| self.is_stale(slot)) {
                entries.remove(&key).and_then(|slot| slot.channel.get().cloned())
            } else {
                None
            };
            let slot = Arc::clone(entries.entry(key).or_insert_with(FlowSlot::empty));
            (slot, evicted)
        };

        if let Some(channel) = evicted {
            debug!("Flow {} expired, re-establishing", key);
            self.release(channel).await;
        }

        match slot.channel.get_or_try_init(open).await {
            Ok(channel) => {
                slot.touch();
                // A failed racer may have dropped the slot before we initialized it
                self.entries
                    .lock()
                    .entry(key)
                    .or_insert_with(|| Arc::clone(&slot));
                Ok(Arc::clone(channel))
            }
            Err(e) => {
                let mut entries = self.entries.lock();
                if let Some(current) = entries.get(&key) {
                    if Arc::ptr_eq(current, &slot) && !current.channel.initialized() {
                        entries.remove(&key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Live channel for `key`. A stale entry is evicted and closed instead.
    pub async fn get(&self, key: &FlowKey) -> Option<ChannelRef> {
        let evicted = {
            let mut entries = self.entries.lock();
            let slot = entries.get(key)?;
            if !self.is_stale(slot) {
                return slot.channel.get().cloned();
            }
            entries.remove(key).and_then(|slot| slot.channel.get().cloned())
        };

        if let Some(channel) = evicted {
            debug!("Flow {} expired", key);
            self.release(channel).await;
        }
        None
    }

    /// Refresh the activity timestamp of `key`
    pub fn touch(&self, key: &FlowKey) {
        if let Some(slot) = self.entries.lock().get(key) {
            slot.touch();
        }
    }

    /// Point `key` at `channel` after traffic arrived on it.
    ///
    /// An entry already using the same channel is only refreshed. An entry
    /// on a different channel is replaced and its old channel released.
    /// A dial in flight for `key` is left alone.
    pub async fn record(&self, key: FlowKey, channel: ChannelRef) {
        let replaced = {
            let mut entries = self.entries.lock();
            let current = entries.get(&key).map(|slot| slot.channel.get().cloned());
            match current {
                // Dial in flight
                Some(None) => return,
                Some(Some(current))
                    if same_channel(&current, &channel)
                        || (current.peer() == channel.peer() && !current.is_closed()) =>
                {
                    if let Some(slot) = entries.get(&key) {
                        slot.touch();
                    }
                    return;
                }
                Some(Some(_)) => entries
                    .insert(key, FlowSlot::with_channel(channel))
                    .and_then(|old| old.channel.get().cloned()),
                None => {
                    debug!("Recording flow {} on {}", key, channel.peer());
                    entries.insert(key, FlowSlot::with_channel(channel));
                    None
                }
            }
        };

        if let Some(old) = replaced {
            self.release(old).await;
        }
    }

    /// Evict `key` and close its channel. Returns whether an entry existed.
    pub async fn remove(&self, key: &FlowKey) -> bool {
        let removed = self.entries.lock().remove(key);
        match removed {
            Some(slot) => {
                if let Some(channel) = slot.channel.get() {
                    debug!("Flow {} removed", key);
                    self.release(Arc::clone(channel)).await;
                }
                true
            }
            None => false,
        }
    }

    /// Evict every entry using `channel` and close it, unless an eviction
    /// already did. Returns the number of entries removed.
    pub async fn remove_channel(&self, channel: &ChannelRef) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, slot| match slot.channel.get() {
                Some(current) => !same_channel(current, channel),
                None => true,
            });
            before - entries.len()
        };

        self.release(Arc::clone(channel)).await;
        removed
    }

    /// Remove every stale entry and close the channels no longer
    /// referenced. Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let expired: Vec<ChannelRef> = {
            let mut entries = self.entries.lock();
            let stale: Vec<FlowKey> = entries
                .iter()
                .filter(|(_, slot)| self.is_stale(slot))
                .map(|(key, _)| *key)
                .collect();
            stale
                .iter()
                .filter_map(|key| entries.remove(key))
                .filter_map(|slot| slot.channel.get().cloned())
                .collect()
        };

        let removed = expired.len();
        let mut closed: Vec<ChannelRef> = Vec::new();
        for channel in expired {
            if closed.iter().any(|c| same_channel(c, &channel)) {
                continue;
            }
            if self.release(Arc::clone(&channel)).await {
                closed.push(channel);
            }
        }

        if removed > 0 {
            debug!("Flow sweep removed {} entries", removed);
        }
        removed
    }

    /// Empty the table and close every channel
    pub async fn close_all(&self) {
        let drained: Vec<ChannelRef> = {
            let mut entries = self.entries.lock();
            entries
                .drain()
                .filter_map(|(_, slot)| slot.channel.get().cloned())
                .collect()
        };

        let mut closed: Vec<ChannelRef> = Vec::new();
        for channel in drained {
            if closed.iter().any(|c| same_channel(c, &channel)) {
                continue;
            }
            channel.close().await;
            closed.push(channel);
        }
        info!("Closed {} flow channels", closed.len());
    }

    /// Number of entries, including dials in flight
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether some entry still references `channel`
    fn references(&self, channel: &ChannelRef) -> bool {
        self.entries.lock().values().any(|slot| {
            slot.channel
                .get()
                .map(|current| same_channel(current, channel))
                .unwrap_or(false)
        })
    }

    /// Close a channel that just left the table, unless it is still in use.
    /// Returns whether it was closed.
    async fn release(&self, channel: ChannelRef) -> bool {
        if channel.is_closed() || self.references(&channel) {
            return false;
        }
        channel.close().await;
        true
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        table.sweep().await;
                    }
                }
            }
            debug!("Flow sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Channel;
    use crate::tunnel::testing::MockChannel;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(last: u8) -> FlowKey {
        FlowKey::new(Ipv4Addr::new(10, 0, 0, last), Ipv4Addr::new(10, 0, 0, 2))
    }

    #[tokio::test]
    async fn test_concurrent_resolve_opens_once() {
        let table = Arc::new(FlowTable::new(Duration::from_secs(60)));
        let opened = Arc::new(AtomicUsize::new(0));
        let channel = MockChannel::new("mock://one");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let table = Arc::clone(&table);
            let opened = Arc::clone(&opened);
            let channel = channel.handle();
            tasks.push(tokio::spawn(async move {
                table
                    .resolve(key(3), || async move {
                        opened.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(channel)
                    })
                    .await
                    .unwrap()
            }));
        }

        let expected = channel.handle();
        for task in tasks {
            let resolved = task.await.unwrap();
            assert!(same_channel(&resolved, &expected));
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_no_entry() {
        let table = FlowTable::new(Duration::from_secs(60));
        let result = table
            .resolve(key(3), || async { Err(TransportError::Timeout) })
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(table.is_empty());

        let channel = MockChannel::new("mock://retry");
        let handle = channel.handle();
        table.resolve(key(3), || async move { Ok(handle) }).await.unwrap();
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_swept_and_closed_once() {
        let table = FlowTable::new(Duration::from_secs(30 * 60));
        let channel = MockChannel::new("mock://idle");
        let handle = channel.handle();
        table.resolve(key(3), || async move { Ok(handle) }).await.unwrap();

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        assert_eq!(table.sweep().await, 0);
        assert!(table.get(&key(3)).await.is_some());

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(table.sweep().await, 1);
        assert!(table.get(&key(3)).await.is_none());
        assert_eq!(table.sweep().await, 0);

        assert!(channel.is_closed());
        assert_eq!(channel.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_entry_alive() {
        let table = FlowTable::new(Duration::from_secs(60));
        let channel = MockChannel::new("mock://busy");
        let handle = channel.handle();
        table.resolve(key(3), || async move { Ok(handle) }).await.unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(40)).await;
            table.touch(&key(3));
        }
        assert_eq!(table.sweep().await, 0);
        assert_eq!(channel.close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_replaced_on_resolve() {
        let table = FlowTable::new(Duration::from_secs(60));
        let first = MockChannel::new("mock://first");
        let second = MockChannel::new("mock://second");

        let handle = first.handle();
        table.resolve(key(3), || async move { Ok(handle) }).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let handle = second.handle();
        let resolved = table.resolve(key(3), || async move { Ok(handle) }).await.unwrap();
        assert_eq!(resolved.peer(), "mock://second");
        assert_eq!(first.close_calls(), 1);
        assert_eq!(second.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_shared_channel_closed_with_last_entry() {
        let table = FlowTable::new(Duration::from_secs(60));
        let channel = MockChannel::new("mock://shared");

        table.record(key(3), channel.handle()).await;
        table.record(key(4), channel.handle()).await;
        assert_eq!(table.len(), 2);

        assert!(table.remove(&key(3)).await);
        assert_eq!(channel.close_calls(), 0);
        assert!(table.remove(&key(4)).await);
        assert_eq!(channel.close_calls(), 1);
        assert!(!table.remove(&key(4)).await);
    }

    #[tokio::test]
    async fn test_record_replaces_different_channel() {
        let table = FlowTable::new(Duration::from_secs(60));
        let old = MockChannel::new("mock://old");
        let new = MockChannel::new("mock://new");

        table.record(key(3), old.handle()).await;
        table.record(key(3), old.handle()).await;
        assert_eq!(old.close_calls(), 0);

        table.record(key(3), new.handle()).await;
        assert_eq!(old.close_calls(), 1);
        assert_eq!(table.get(&key(3)).await.unwrap().peer(), "mock://new");
    }

    #[tokio::test]
    async fn test_remove_channel_and_close_all() {
        let table = FlowTable::new(Duration::from_secs(60));
        let a = MockChannel::new("mock://a");
        let b = MockChannel::new("mock://b");

        table.record(key(3), a.handle()).await;
        table.record(key(4), a.handle()).await;
        table.record(key(5), b.handle()).await;

        assert_eq!(table.remove_channel(&a.handle()).await, 2);
        assert_eq!(a.close_calls(), 1);
        assert_eq!(table.len(), 1);

        table.close_all().await;
        assert!(table.is_empty());
        assert_eq!(b.close_calls(), 1);

        // Ingress for a channel the table already closed
        assert_eq!(table.remove_channel(&b.handle()).await, 0);
        assert_eq!(b.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_stale() {
        let table = FlowTable::new(Duration::from_secs(60));
        let channel = MockChannel::new("mock://dead");
        table.record(key(3), channel.handle()).await;

        channel.handle().close().await;
        assert!(table.get(&key(3)).await.is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task() {
        let table = Arc::new(FlowTable::new(Duration::from_secs(60)));
        let channel = MockChannel::new("mock://swept");
        table.record(key(3), channel.handle()).await;

        let cancel = CancellationToken::new();
        let sweeper = table.spawn_sweeper(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(table.is_empty());
        assert_eq!(channel.close_calls(), 1);

        cancel.cancel();
        sweeper.await.unwrap();
    }
}
