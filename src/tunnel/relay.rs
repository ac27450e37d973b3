//! Relay pump
//!
//! The egress loop reads frames from the interface, resolves a channel for
//! each through the flow table and sends the obfuscated frame. Ingress tasks
//! (one per receiving channel) de-obfuscate and queue frames on the
//! interface writer. Nothing here waits on a failed send: the frame is
//! dropped and the loop moves on.

use super::{DeviceRef, FlowTable, TunWriter, MAX_FRAME_SIZE};
use crate::obfuscation::FrameTransform;
use crate::protocol::{is_ipv4, FlowKey};
use crate::transport::{ChannelReceiver, ChannelRef, Dialer, TransportError};
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause after a failed interface read before trying again
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How the egress loop finds a channel for a frame
#[derive(Clone)]
pub enum Routing {
    /// Resolve through the flow table, dialing on a miss (clients)
    Dial(Arc<dyn Dialer>),
    /// Resolve through the flow table only; unknown flows are dropped (servers)
    Lookup,
    /// Every frame goes over one channel, addressed or not (peer mode)
    PointToPoint(ChannelRef),
}

/// How an ingress task associates inbound frames with flows
#[derive(Debug, Clone, Copy)]
pub enum Binding {
    /// The channel was dialed for this flow
    Fixed(FlowKey),
    /// Record whatever flow each inbound frame belongs to
    Learn,
}

/// Why the egress loop dropped a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    /// Not IPv4, and the routing needs addresses
    Unaddressed,
    /// No flow entry and no way to dial
    NoFlow,
    DialFailed,
    NotReady,
    SendFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DropReason::Empty => "empty frame",
            DropReason::Unaddressed => "not addressed",
            DropReason::NoFlow => "no flow",
            DropReason::DialFailed => "dial failed",
            DropReason::NotReady => "channel not ready",
            DropReason::SendFailed => "send failed",
        };
        f.write_str(reason)
    }
}

/// Outcome of forwarding one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Sent,
    Dropped(DropReason),
}

/// Frame pump shared by the egress loop and every ingress task
#[derive(Clone)]
pub struct Relay {
    flows: Arc<FlowTable>,
    transform: Arc<FrameTransform>,
    writer: TunWriter,
    cancel: CancellationToken,
}

impl Relay {
    pub fn new(
        flows: Arc<FlowTable>,
        transform: Arc<FrameTransform>,
        writer: TunWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            flows,
            transform,
            writer,
            cancel,
        }
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    pub fn transform(&self) -> &Arc<FrameTransform> {
        &self.transform
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Read frames from `device` and forward them until cancelled or the
    /// device goes away
    pub async fn run_egress(&self, device: DeviceRef, routing: Routing) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        info!("Egress loop started");

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = device.recv(&mut buf) => match read {
                    Ok(n) => n,
                    Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe) => {
                        info!("Interface closed: {}", e);
                        break;
                    }
                    Err(e) => {
                        warn!("Interface read failed: {}", e);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(READ_RETRY_DELAY) => continue,
                        }
                    }
                },
            };

            if let Forwarded::Dropped(reason) = self.forward(&buf[..n], &routing).await {
                debug!("Dropped outbound frame ({} bytes): {}", n, reason);
            }
        }

        info!("Egress loop stopped");
    }

    /// Spawn [`run_egress`](Self::run_egress) on its own task
    pub fn spawn_egress(&self, device: DeviceRef, routing: Routing) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move { relay.run_egress(device, routing).await })
    }

    /// Send one outbound frame
    pub async fn forward(&self, frame: &[u8], routing: &Routing) -> Forwarded {
        if frame.is_empty() {
            return Forwarded::Dropped(DropReason::Empty);
        }

        let (channel, key) = match routing {
            Routing::PointToPoint(channel) => (Arc::clone(channel), None),
            Routing::Lookup => {
                let Some(key) = FlowKey::outbound(frame) else {
                    return Forwarded::Dropped(DropReason::Unaddressed);
                };
                match self.flows.get(&key).await {
                    Some(channel) => (channel, Some(key)),
                    None => return Forwarded::Dropped(DropReason::NoFlow),
                }
            }
            Routing::Dial(dialer) => {
                let Some(key) = FlowKey::outbound(frame) else {
                    return Forwarded::Dropped(DropReason::Unaddressed);
                };
                match self.resolve(key, dialer).await {
                    Some(channel) => (channel, Some(key)),
                    None => return Forwarded::Dropped(DropReason::DialFailed),
                }
            }
        };

        if !channel.is_ready() {
            return Forwarded::Dropped(DropReason::NotReady);
        }

        let data = self.transform.encode(frame);
        match channel.send(&data).await {
            Ok(()) => {
                trace!("Sent {} bytes to {}", data.len(), channel.peer());
                if let Some(key) = key {
                    self.flows.touch(&key);
                }
                Forwarded::Sent
            }
            Err(e) if e.is_fatal() => {
                warn!("Channel {} failed: {}", channel.peer(), e);
                if let Some(key) = key {
                    self.flows.remove(&key).await;
                }
                Forwarded::Dropped(DropReason::SendFailed)
            }
            Err(TransportError::NotReady) => {
                Forwarded::Dropped(DropReason::NotReady)
            }
            Err(e) => {
                warn!("Send to {} failed: {}", channel.peer(), e);
                Forwarded::Dropped(DropReason::SendFailed)
            }
        }
    }

    async fn resolve(&self, key: FlowKey, dialer: &Arc<dyn Dialer>) -> Option<ChannelRef> {
        let dialer = Arc::clone(dialer);
        let relay = self.clone();
        let result = self
            .flows
            .resolve(key, || async move {
                let dialed = dialer.dial(&key).await?;
                info!("Opened {} for flow {}", dialed.channel.peer(), key);
                if let Some(receiver) = dialed.receiver {
                    relay.spawn_ingress(
                        Arc::clone(&dialed.channel),
                        receiver,
                        Binding::Fixed(key),
                    );
                }
                Ok(dialed.channel)
            })
            .await;

        match result {
            Ok(channel) => Some(channel),
            Err(e) => {
                warn!("Failed to open channel for flow {}: {}", key, e);
                None
            }
        }
    }

    /// De-obfuscate an inbound frame and queue it for the interface.
    /// Returns the frame written, or `None` when it was dropped.
    pub async fn deliver(&self, data: &[u8], require_ipv4: bool) -> Option<Bytes> {
        let frame = self.transform.decode(data);
        if frame.is_empty() {
            return None;
        }
        if require_ipv4 && !is_ipv4(&frame) {
            debug!("Dropped inbound frame ({} bytes): not IPv4", frame.len());
            return None;
        }

        match self.writer.write(frame.clone()).await {
            Ok(()) => Some(frame),
            Err(e) => {
                debug!("Dropped inbound frame: {}", e);
                None
            }
        }
    }

    /// Pump frames from one channel to the interface until the channel
    /// ends, then evict its flows and close it.
    pub async fn run_ingress(
        &self,
        channel: ChannelRef,
        mut receiver: Box<dyn ChannelReceiver>,
        binding: Binding,
    ) {
        debug!("Ingress started for {}", channel.peer());

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = receiver.recv() => next,
            };

            let data = match next {
                Some(Ok(data)) => data,
                Some(Err(e)) if e.is_fatal() => {
                    debug!("{}: {}", channel.peer(), e);
                    break;
                }
                Some(Err(e)) => {
                    warn!("{}: receive failed: {}", channel.peer(), e);
                    continue;
                }
                None => break,
            };

            let Some(frame) = self.deliver(&data, true).await else {
                continue;
            };

            match binding {
                Binding::Fixed(key) => self.flows.touch(&key),
                Binding::Learn => {
                    if let Some(key) = FlowKey::inbound(&frame) {
                        // Same key a reply read from the interface resolves to
                        self.flows.record(key, Arc::clone(&channel)).await;
                    }
                }
            }
        }

        let removed = self.flows.remove_channel(&channel).await;
        debug!(
            "Ingress ended for {} ({} flows removed)",
            channel.peer(),
            removed
        );
    }

    /// Spawn [`run_ingress`](Self::run_ingress) on its own task
    pub fn spawn_ingress(
        &self,
        channel: ChannelRef,
        receiver: Box<dyn ChannelReceiver>,
        binding: Binding,
    ) -> JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move { relay.run_ingress(channel, receiver, binding).await })
    }
}
