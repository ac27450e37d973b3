//! Virtual interface seam
//!
//! The relay reads outbound frames from a [`TunDevice`] and writes inbound
//! frames back to it. Creating and configuring the OS interface is the job
//! of a [`DeviceFactory`].

use super::TunnelError;
use crate::session::Lease;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frames waiting for the interface writer
const WRITE_QUEUE_DEPTH: usize = 1024;

/// A virtual network interface carrying raw IP frames
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one frame into `buf`
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame
    async fn send(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Shared device handle
pub type DeviceRef = Arc<dyn TunDevice>;

/// Addressing applied to a new interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub address: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: usize,
}

impl InterfaceConfig {
    pub fn new(address: Ipv4Addr, prefix: u8, mtu: usize) -> Self {
        Self {
            address,
            prefix,
            gateway: None,
            mtu,
        }
    }

    /// Interface settings for a client that received `lease`
    pub fn from_lease(lease: &Lease, mtu: usize) -> Self {
        Self {
            address: lease.client,
            prefix: lease.block.prefix_len(),
            gateway: Some(lease.gateway),
            mtu,
        }
    }
}

/// Creates and configures interfaces
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn create(&self, config: &InterfaceConfig) -> Result<DeviceRef, TunnelError>;
}

/// Serializes every write to the interface through one task.
///
/// Ingress paths clone the writer and enqueue; only the task touches the
/// device, so concurrent frames are never interleaved.
#[derive(Clone)]
pub struct TunWriter {
    tx: mpsc::Sender<Bytes>,
}

impl TunWriter {
    /// Start the writer task. It stops, dropping its device handle, when
    /// `cancel` fires or every writer clone is gone.
    pub fn spawn(device: DeviceRef, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                if let Err(e) = device.send(&frame).await {
                    warn!("Interface write failed ({} bytes): {}", frame.len(), e);
                }
            }
            debug!("Interface writer stopped");
        });

        (Self { tx }, task)
    }

    /// Queue a frame for the interface
    pub async fn write(&self, frame: Bytes) -> Result<(), TunnelError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TunnelError::WriterClosed)
    }
}

/// In-process interface. The paired [`MemoryDeviceHandle`] plays the
/// operating system: it injects outbound frames and observes writes.
pub struct MemoryDevice {
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    written: mpsc::UnboundedSender<Bytes>,
}

/// Test-side end of a [`MemoryDevice`]
pub struct MemoryDeviceHandle {
    inject: mpsc::Sender<Bytes>,
    written: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryDevice {
    pub fn new() -> (Arc<MemoryDevice>, MemoryDeviceHandle) {
        let (inject, inbound) = mpsc::channel(256);
        let (written_tx, written) = mpsc::unbounded_channel();
        (
            Arc::new(MemoryDevice {
                inbound: Mutex::new(inbound),
                written: written_tx,
            }),
            MemoryDeviceHandle { inject, written },
        )
    }
}

#[async_trait]
impl TunDevice for MemoryDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device closed")),
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        self.written
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        Ok(frame.len())
    }
}

impl MemoryDeviceHandle {
    /// Hand a frame to the relay as if the OS had routed it into the interface
    pub async fn inject(&self, frame: impl Into<Bytes>) {
        let _ = self.inject.send(frame.into()).await;
    }

    /// Next frame the relay wrote to the interface
    pub async fn next_written(&mut self) -> Option<Bytes> {
        self.written.recv().await
    }

    /// A written frame, if one is already waiting
    pub fn try_written(&mut self) -> Option<Bytes> {
        self.written.try_recv().ok()
    }
}

/// Creates [`MemoryDevice`]s and reports each one with its settings
pub struct MemoryDeviceFactory {
    created: mpsc::UnboundedSender<(InterfaceConfig, MemoryDeviceHandle)>,
    fail: bool,
}

impl MemoryDeviceFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(InterfaceConfig, MemoryDeviceHandle)>) {
        let (created, rx) = mpsc::unbounded_channel();
        (
            Self {
                created,
                fail: false,
            },
            rx,
        )
    }

    /// A factory whose every `create` fails
    pub fn failing() -> Self {
        let (created, _) = mpsc::unbounded_channel();
        Self {
            created,
            fail: true,
        }
    }
}

#[async_trait]
impl DeviceFactory for MemoryDeviceFactory {
    async fn create(&self, config: &InterfaceConfig) -> Result<DeviceRef, TunnelError> {
        if self.fail {
            return Err(TunnelError::Interface(format!(
                "cannot allocate interface for {}/{}",
                config.address, config.prefix
            )));
        }
        let (device, handle) = MemoryDevice::new();
        let _ = self.created.send((config.clone(), handle));
        Ok(device)
    }
}
