//! Wire-level definitions shared by both ends of the tunnel
//!
//! - IPv4 header inspection used to key flows
//! - JSON control messages exchanged on the peer `control` channel
//! - Session descriptors exchanged out-of-band during negotiation

mod control;
mod descriptor;
mod ipv4;

pub use control::{ControlMessage, IpAllocation, MESSAGE_ID_IP_ALLOCATE};
pub use descriptor::{DescriptorKind, SessionDescriptor};
pub use ipv4::{is_ipv4, FlowKey, Ipv4Header, IPV4_MIN_HEADER_LEN};

#[cfg(test)]
pub(crate) use ipv4::build_frame;

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed control message: {0}")]
    MalformedControl(#[from] serde_json::Error),

    #[error("Invalid session descriptor: {0}")]
    Descriptor(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Unexpected descriptor: expected {expected}, got {actual}")]
    UnexpectedDescriptor {
        expected: DescriptorKind,
        actual: DescriptorKind,
    },
}

/// Label of the data channel carrying tunneled frames
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Label of the data channel carrying control messages
pub const CONTROL_CHANNEL_LABEL: &str = "control";
