//! Node orchestration
//!
//! A [`Node`] owns the validated configuration, the frame transform and the
//! root cancellation token. Each mode (UDP, WebSocket, peer data channel;
//! server or client) starts one relay [`Runtime`] around its interface and
//! tears it down when the token fires.

mod peer;
mod udp;
mod ws;

pub use udp::{UdpClient, UdpServer};
pub use ws::{WsClient, WsServer};

use crate::config::{Config, Protocol};
use crate::obfuscation::FrameTransform;
use crate::session::Signaling;
use crate::transport::{PeerConnection, PeerEvents};
use crate::tunnel::{DeviceFactory, DeviceRef, FlowTable, Relay, TunWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What every relay runtime is built from
#[derive(Clone)]
pub struct RelayContext {
    transform: Arc<FrameTransform>,
    flow_ttl: Duration,
    sweep_interval: Duration,
    cancel: CancellationToken,
}

impl RelayContext {
    pub fn new(
        transform: Arc<FrameTransform>,
        flow_ttl: Duration,
        sweep_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transform,
            flow_ttl,
            sweep_interval,
            cancel,
        }
    }

    /// Context for `config`, cancelled by `cancel`
    pub fn from_config(config: &Config, cancel: CancellationToken) -> crate::Result<Self> {
        Ok(Self::new(
            Arc::new(FrameTransform::new(&config.node.key)?),
            config.flow_ttl(),
            config.sweep_interval(),
            cancel,
        ))
    }

    pub fn transform(&self) -> &Arc<FrameTransform> {
        &self.transform
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start the interface writer and the flow sweeper for `device`
    pub(crate) fn start(&self, device: DeviceRef) -> Runtime {
        let cancel = self.cancel.child_token();
        let flows = Arc::new(FlowTable::new(self.flow_ttl));
        let (writer, writer_task) = TunWriter::spawn(device, cancel.clone());
        let sweeper = flows.spawn_sweeper(self.sweep_interval, cancel.clone());
        let relay = Relay::new(flows, Arc::clone(&self.transform), writer, cancel.clone());

        Runtime {
            relay,
            cancel,
            tasks: vec![writer_task, sweeper],
        }
    }
}

/// A running relay and the tasks serving it
pub(crate) struct Runtime {
    relay: Relay,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub(crate) fn relay(&self) -> &Relay {
        &self.relay
    }

    pub(crate) fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Stop every task, close every flow channel and release the interface
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        self.relay.flows().close_all().await;
        for task in self.tasks {
            let _ = task.await;
        }
        debug!("Relay runtime stopped");
    }
}

/// A configured tunnel endpoint
pub struct Node {
    config: Arc<Config>,
    context: RelayContext,
}

impl Node {
    /// Validate `config` and prepare the node
    pub fn new(config: Config) -> crate::Result<Self> {
        config.validate()?;
        let context = RelayContext::from_config(&config, CancellationToken::new())?;
        Ok(Self {
            config: Arc::new(config),
            context,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Token that stops the node when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down");
        self.context.cancel.cancel();
    }

    /// Run a UDP or WebSocket node until cancelled
    pub async fn run(&self, devices: &dyn DeviceFactory) -> crate::Result<()> {
        let config = &self.config;
        let node = &config.node;

        if node.protocol == Protocol::Rtc {
            return Err(crate::Error::Config(
                "peer data-channel mode needs a peer connection; use run_peer".to_string(),
            ));
        }

        let device = devices.create(&config.interface()?).await?;

        match (node.protocol, node.server_mode) {
            (Protocol::Udp, true) => {
                UdpServer::bind(self.context.clone(), &node.local_addr)
                    .await?
                    .serve(device)
                    .await
            }
            (Protocol::Udp, false) => {
                UdpClient::bind(
                    self.context.clone(),
                    &node.local_addr,
                    node.server_addr.as_deref().unwrap_or_default(),
                )
                .await?
                .serve(device)
                .await
            }
            (protocol, true) => {
                if protocol == Protocol::Wss {
                    info!("wss server speaks plain ws; terminate TLS in front of it");
                }
                WsServer::bind(self.context.clone(), &node.local_addr, config.ws_settings())
                    .await?
                    .serve(device)
                    .await
            }
            (protocol, false) => {
                WsClient::new(
                    self.context.clone(),
                    node.server_addr.as_deref().unwrap_or_default(),
                    protocol == Protocol::Wss,
                    config.ws_settings(),
                )
                .serve(device)
                .await
            }
        }
    }

    /// Run a peer data-channel node over `peer` until the session ends or
    /// the node is cancelled
    pub async fn run_peer(
        &self,
        devices: &dyn DeviceFactory,
        peer: Arc<dyn PeerConnection>,
        events: PeerEvents,
        signaling: &mut dyn Signaling,
    ) -> crate::Result<()> {
        if self.config.node.data_channels > 1 {
            info!(
                "{} data channels requested; frames share a single channel",
                self.config.node.data_channels
            );
        }

        if self.config.node.server_mode {
            peer::serve(&self.config, &self.context, devices, peer, events, signaling).await
        } else {
            peer::connect(&self.config, &self.context, devices, peer, events, signaling).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FlowKey;
    use crate::transport::{ChannelReceiver, TransportError};
    use crate::tunnel::testing::MockChannel;
    use crate::tunnel::{Binding, MemoryDevice};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    /// Receiver that never yields a frame
    struct Silent;

    #[async_trait]
    impl ChannelReceiver for Silent {
        async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
            std::future::pending().await
        }
    }

    fn key(last: u8) -> FlowKey {
        FlowKey::new(Ipv4Addr::new(10, 0, 0, last), Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_channel() {
        let context = RelayContext::new(
            Arc::new(FrameTransform::new("runtime test key").unwrap()),
            Duration::from_secs(60),
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        let (device, _handle) = MemoryDevice::new();
        let mut runtime = context.start(device);
        let relay = runtime.relay().clone();

        let a = MockChannel::new("mock://a");
        let b = MockChannel::new("mock://b");
        relay.flows().record(key(2), a.handle()).await;
        relay.flows().record(key(3), a.handle()).await;
        relay.flows().record(key(4), b.handle()).await;
        runtime.track(relay.spawn_ingress(a.handle(), Box::new(Silent), Binding::Learn));
        runtime.track(relay.spawn_ingress(b.handle(), Box::new(Silent), Binding::Fixed(key(4))));

        runtime.shutdown().await;

        assert!(relay.flows().is_empty());
        assert!(relay.cancel_token().is_cancelled());
        assert_eq!(a.close_calls(), 1);
        assert_eq!(b.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_root_cancel_reaches_runtime() {
        let cancel = CancellationToken::new();
        let context = RelayContext::new(
            Arc::new(FrameTransform::new("runtime test key").unwrap()),
            Duration::from_secs(60),
            Duration::from_secs(10),
            cancel.clone(),
        );
        let (device, _handle) = MemoryDevice::new();
        let runtime = context.start(device);

        cancel.cancel();
        assert!(runtime.relay().cancel_token().is_cancelled());
        runtime.shutdown().await;
    }
}
