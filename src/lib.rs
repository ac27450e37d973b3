//! # Veilnet
//!
//! An obfuscated layer-3 tunnel. Each endpoint gets a virtual interface;
//! raw IP frames read from it are obfuscated and carried to the other end
//! over one of several interchangeable transports.
//!
//! ## Features
//!
//! - **UDP**: one shared socket, connectionless
//! - **WebSocket** (`ws`/`wss`): one connection per flow
//! - **Peer data channels**: negotiated out-of-band, with address leases
//!   delivered over a control channel
//! - **Flow table** with idle expiry that closes what it evicts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Node Layer                       │
//! │      (UDP / WebSocket / peer server and client)      │
//! ├─────────────────────────────────────────────────────┤
//! │                    Session Layer                     │
//! │    (Descriptor exchange, state machine, leases)      │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │   (Interface, single writer, flow table, relay)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Obfuscation Layer                   │
//! │            (Frame transform, key derivation)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │          (UDP, WebSocket, peer data channels)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod node;
pub mod obfuscation;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use node::Node;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum frame size (64 KB)
pub const MAX_FRAME_SIZE: usize = tunnel::MAX_FRAME_SIZE;

/// Default interface MTU
pub const DEFAULT_MTU: usize = 1500;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Interface setup failed: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}
