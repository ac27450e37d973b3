//! Veilnet Server
//!
//! Brings up the gateway interface and relays frames from clients:
//! - UDP: one socket, flows learned from inbound traffic
//! - WebSocket: one connection per client flow
//! - Peer data channel: offers a session and hands out address leases

use anyhow::{Context, Result};
use clap::Parser;
use veilnet::config::{generate_example_config, Config, Protocol};
use veilnet::tunnel::TunRsFactory;
use veilnet::Node;
use tracing::{error, info};

/// Veilnet Server - obfuscated layer-3 tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "veilnet-server")]
#[command(about = "Veilnet Server - obfuscated layer-3 tunnel over UDP, WebSocket or peer data channels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Transport: udp, ws, wss or rtc (overrides config)
    #[arg(short, long)]
    protocol: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    local: Option<String>,

    /// Interface address and prefix, e.g. 10.0.0.1/24 (overrides config)
    #[arg(long)]
    cidr: Option<String>,

    /// Shared secret (overrides config)
    #[arg(short, long)]
    key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.example_config {
        let mut config = generate_example_config();
        config.node.server_mode = true;
        config.node.server_addr = None;
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    config.node.server_mode = true;
    if let Some(protocol) = &args.protocol {
        config.node.protocol = protocol.parse::<Protocol>()?;
    }
    if let Some(local) = args.local {
        config.node.local_addr = local;
    }
    if let Some(cidr) = args.cidr {
        config.node.cidr = cidr;
    }
    if let Some(key) = args.key {
        config.node.key = key;
    }

    // Initialize logging
    config.logging.install(args.log_level.as_deref());

    let node = Node::new(config).context("Invalid configuration")?;
    info!(
        "Veilnet server {} starting ({} on {})",
        veilnet::VERSION,
        node.config().node.protocol,
        node.config().node.local_addr
    );

    let cancel = node.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            cancel.cancel();
        }
    });

    let devices = TunRsFactory;
    let result = if node.config().node.protocol == Protocol::Rtc {
        run_peer(&node, &devices).await
    } else {
        node.run(&devices).await.context("Server failed")
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

#[cfg(feature = "webrtc")]
async fn run_peer(node: &Node, devices: &TunRsFactory) -> Result<()> {
    use std::sync::Arc;
    use veilnet::session::ConsoleSignaling;
    use veilnet::transport::RtcPeer;

    let (peer, events) = RtcPeer::new(&node.config().rtc_config(), true)
        .await
        .context("Failed to set up peer connection")?;
    let mut signaling = ConsoleSignaling::new();
    node.run_peer(devices, Arc::new(peer), events, &mut signaling)
        .await
        .context("Peer session failed")
}

#[cfg(not(feature = "webrtc"))]
async fn run_peer(_node: &Node, _devices: &TunRsFactory) -> Result<()> {
    anyhow::bail!("this build has no peer data-channel support (enable the `webrtc` feature)")
}
