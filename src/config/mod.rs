//! Configuration management

use crate::session::Role;
use crate::transport::WsSettings;
use crate::tunnel::InterfaceConfig;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Flow table tuning
    #[serde(default)]
    pub flows: FlowConfig,
    /// WebSocket transport settings
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// Peer data-channel settings
    #[serde(default)]
    pub peer: PeerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check the configuration before anything is started
    pub fn validate(&self) -> Result<(), crate::Error> {
        let node = &self.node;

        if node.key.is_empty() {
            return Err(crate::Error::Config("node.key must not be empty".to_string()));
        }
        self.block()?;

        if node.mtu < 576 || node.mtu > crate::MAX_FRAME_SIZE {
            return Err(crate::Error::Config(format!(
                "node.mtu {} out of range (576..={})",
                node.mtu,
                crate::MAX_FRAME_SIZE
            )));
        }

        if node.server_mode || node.protocol == Protocol::Udp {
            node.local_addr.parse::<std::net::SocketAddr>().map_err(|e| {
                crate::Error::Config(format!("Invalid node.local_addr '{}': {}", node.local_addr, e))
            })?;
        }

        if !node.server_mode && node.protocol != Protocol::Rtc {
            match node.server_addr.as_deref() {
                Some(addr) if !addr.is_empty() => {}
                _ => {
                    return Err(crate::Error::Config(format!(
                        "node.server_addr is required for a {} client",
                        node.protocol
                    )))
                }
            }
        }

        if node.data_channels == 0 {
            return Err(crate::Error::Config(
                "node.data_channels must be at least 1".to_string(),
            ));
        }

        if self.flows.ttl_secs == 0 || self.flows.sweep_secs == 0 {
            return Err(crate::Error::Config(
                "flows.ttl_secs and flows.sweep_secs must be positive".to_string(),
            ));
        }

        if !self.websocket.path.starts_with('/') {
            return Err(crate::Error::Config(format!(
                "websocket.path '{}' must start with '/'",
                self.websocket.path
            )));
        }

        Ok(())
    }

    pub fn role(&self) -> Role {
        if self.node.server_mode {
            Role::Server
        } else {
            Role::Client
        }
    }

    /// The configured address block, with host bits as written
    pub fn block(&self) -> Result<Ipv4Net, crate::Error> {
        self.node.cidr.parse().map_err(|e| {
            crate::Error::Config(format!("Invalid node.cidr '{}': {}", self.node.cidr, e))
        })
    }

    /// Interface settings taken straight from `node.cidr`
    pub fn interface(&self) -> Result<InterfaceConfig, crate::Error> {
        let block = self.block()?;
        Ok(InterfaceConfig::new(
            block.addr(),
            block.prefix_len(),
            self.node.mtu,
        ))
    }

    pub fn flow_ttl(&self) -> Duration {
        Duration::from_secs(self.flows.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.flows.sweep_secs)
    }

    /// WebSocket transport settings
    pub fn ws_settings(&self) -> WsSettings {
        WsSettings {
            path: self.websocket.path.clone(),
            user_agent: self.websocket.user_agent.clone(),
            read_timeout: Duration::from_secs(self.websocket.read_timeout_secs),
            ..WsSettings::default()
        }
    }

    /// Peer connection settings
    #[cfg(feature = "webrtc")]
    pub fn rtc_config(&self) -> crate::transport::RtcPeerConfig {
        crate::transport::RtcPeerConfig {
            stun_servers: self.peer.stun_servers.clone(),
            ordered: self.peer.ordered,
            max_packet_lifetime_ms: self.peer.max_packet_lifetime_ms,
        }
    }
}

/// Transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Ws,
    Wss,
    Rtc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
            Protocol::Rtc => "rtc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "ws" => Ok(Protocol::Ws),
            "wss" => Ok(Protocol::Wss),
            "rtc" | "webrtc" => Ok(Protocol::Rtc),
            other => Err(crate::Error::Config(format!("Unknown protocol '{}'", other))),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Shared secret the frame transform key is derived from
    pub key: String,
    /// Interface address and prefix; on a peer server, the lease block
    pub cidr: String,
    /// Transport
    #[serde(default)]
    pub protocol: Protocol,
    /// Bind address
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    /// Server address for clients
    #[serde(default)]
    pub server_addr: Option<String>,
    /// Run as server
    #[serde(default)]
    pub server_mode: bool,
    /// Data channel count hint (peer mode)
    #[serde(default = "default_data_channels")]
    pub data_channels: u16,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

fn default_local_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_channels() -> u16 {
    1
}

fn default_mtu() -> usize {
    crate::DEFAULT_MTU
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            cidr: "10.0.0.1/24".to_string(),
            protocol: Protocol::Udp,
            local_addr: default_local_addr(),
            server_addr: None,
            server_mode: false,
            data_channels: default_data_channels(),
            mtu: default_mtu(),
        }
    }
}

/// Flow table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Idle time before a flow expires
    pub ttl_secs: u64,
    /// Interval between expiry sweeps
    pub sweep_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ttl_secs: crate::tunnel::DEFAULT_FLOW_TTL.as_secs(),
            sweep_secs: crate::tunnel::DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Upgrade path
    pub path: String,
    /// User-Agent presented by clients
    pub user_agent: String,
    /// Idle connections are dropped after this many seconds
    pub read_timeout_secs: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let settings = WsSettings::default();
        Self {
            path: settings.path,
            user_agent: settings.user_agent,
            read_timeout_secs: settings.read_timeout.as_secs(),
        }
    }
}

/// Peer data-channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// ICE servers
    pub stun_servers: Vec<String>,
    /// Ordered delivery on data channels
    pub ordered: bool,
    /// Maximum packet lifetime in milliseconds
    pub max_packet_lifetime_ms: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            ordered: false,
            max_packet_lifetime_ms: 5000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `level_override` wins over the
    /// configured level. Does nothing if a subscriber is already set.
    pub fn install(&self, level_override: Option<&str>) {
        let level = level_override.unwrap_or(&self.level);
        let filter = tracing_subscriber::EnvFilter::try_new(level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let _ = match self.format.as_str() {
            "compact" => builder.compact().try_init(),
            _ => builder.pretty().try_init(),
        };
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        node: NodeConfig {
            key: "change-me".to_string(),
            server_addr: Some("203.0.113.10:3000".to_string()),
            ..NodeConfig::default()
        },
        flows: FlowConfig::default(),
        websocket: WebSocketConfig::default(),
        peer: PeerConfig::default(),
        logging: LoggingConfig::default(),
    }
}
