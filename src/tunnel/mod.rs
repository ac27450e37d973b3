//! Tunnel layer - moves frames between the interface and transports
//!
//! Provides:
//! - The virtual interface seam and its single writer
//! - The flow table mapping flows to transport channels
//! - The relay pump (egress and ingress loops)

mod device;
mod flow_table;
mod relay;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(feature = "tun")]
mod tun;

pub use device::{
    DeviceFactory, DeviceRef, InterfaceConfig, MemoryDevice, MemoryDeviceFactory,
    MemoryDeviceHandle, TunDevice, TunWriter,
};
pub use flow_table::FlowTable;
pub use relay::{Binding, DropReason, Forwarded, Relay, Routing};
#[cfg(feature = "tun")]
pub use tun::{TunRsDevice, TunRsFactory};

use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Interface error: {0}")]
    Interface(String),

    #[error("Interface writer closed")]
    WriterClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Largest frame read from the interface in one call
pub const MAX_FRAME_SIZE: usize = 65535;

/// Idle time after which a flow entry is stale (30 minutes)
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(30 * 60);

/// Interval between flow table sweeps (10 minutes)
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
