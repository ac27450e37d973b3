//! Minimal IPv4 header inspection
//!
//! Header layout (first 20 bytes):
//! ```text
//! +--------+--------+--------+--------+
//! |Ver| IHL|  TOS   |  Total Length   |
//! +--------+--------+--------+--------+
//! |  Identification |Flags| Frag Off  |
//! +--------+--------+--------+--------+
//! |  TTL   | Proto  |    Checksum     |
//! +--------+--------+--------+--------+
//! |          Source Address           |
//! +--------+--------+--------+--------+
//! |        Destination Address        |
//! +--------+--------+--------+--------+
//! ```

use std::fmt;
use std::net::Ipv4Addr;

/// Smallest valid IPv4 header
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// Addressing extracted from an IPv4 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
}

impl Ipv4Header {
    /// Parse the header of `frame`, returning `None` for anything that is
    /// not a well-formed IPv4 datagram header.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < IPV4_MIN_HEADER_LEN {
            return None;
        }
        if frame[0] >> 4 != 4 {
            return None;
        }
        let ihl = (frame[0] & 0x0f) as usize * 4;
        if ihl < IPV4_MIN_HEADER_LEN || frame.len() < ihl {
            return None;
        }

        Some(Self {
            source: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
            destination: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
            protocol: frame[9],
        })
    }
}

/// Whether `frame` carries an IPv4 datagram
pub fn is_ipv4(frame: &[u8]) -> bool {
    Ipv4Header::parse(frame).is_some()
}

/// Identity of one direction of a flow: the remote tunnel address paired
/// with the local tunnel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub peer: Ipv4Addr,
    pub local: Ipv4Addr,
}

impl FlowKey {
    pub fn new(peer: Ipv4Addr, local: Ipv4Addr) -> Self {
        Self { peer, local }
    }

    /// Key for a frame read from the local interface: (destination, source)
    pub fn outbound(frame: &[u8]) -> Option<Self> {
        Ipv4Header::parse(frame).map(|h| Self::new(h.destination, h.source))
    }

    /// Key for a frame received from a transport: (source, destination)
    pub fn inbound(frame: &[u8]) -> Option<Self> {
        Ipv4Header::parse(frame).map(|h| Self::new(h.source, h.destination))
    }

    /// The key of the opposite direction
    pub fn mirrored(&self) -> Self {
        Self::new(self.local, self.peer)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.peer, self.local)
    }
}

#[cfg(test)]
pub(crate) fn build_frame(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_MIN_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; IPV4_MIN_HEADER_LEN];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    frame[8] = 64;
    frame[9] = 17;
    frame[12..16].copy_from_slice(&src.octets());
    frame[16..20].copy_from_slice(&dst.octets());
    frame.extend_from_slice(payload);
    frame
}
