//! UDP server and client

use super::RelayContext;
use crate::protocol::FlowKey;
use crate::transport::{UdpChannel, UdpDialer, UdpReceiver};
use crate::tunnel::{DeviceRef, Routing, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

async fn bind_socket(addr: &str) -> crate::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| crate::Error::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    Ok(Arc::new(socket))
}

/// UDP server: learns flows from inbound datagrams, never dials
pub struct UdpServer {
    context: RelayContext,
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    pub async fn bind(context: RelayContext, addr: &str) -> crate::Result<Self> {
        let socket = bind_socket(addr).await?;
        Ok(Self { context, socket })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Relay between `device` and the socket until cancelled
    pub async fn serve(self, device: DeviceRef) -> crate::Result<()> {
        info!("UDP server listening on {}", self.local_addr()?);

        let mut runtime = self.context.start(Arc::clone(&device));
        let relay = runtime.relay().clone();
        runtime.track(relay.spawn_egress(device, Routing::Lookup));

        let mut receiver = UdpReceiver::new(Arc::clone(&self.socket), MAX_FRAME_SIZE);
        let cancel = relay.cancel_token().clone();

        loop {
            let (data, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv_from() => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            let Some(frame) = relay.deliver(&data, true).await else {
                continue;
            };
            if let Some(key) = FlowKey::inbound(&frame) {
                let channel = Arc::new(UdpChannel::new(Arc::clone(&self.socket), from));
                relay.flows().record(key, channel).await;
            }
        }

        runtime.shutdown().await;
        info!("UDP server stopped");
        Ok(())
    }
}

/// UDP client: every flow goes to the one server over one socket
pub struct UdpClient {
    context: RelayContext,
    socket: Arc<UdpSocket>,
    server: SocketAddr,
}

impl UdpClient {
    /// Bind `local_addr` and resolve `server_addr`
    pub async fn bind(
        context: RelayContext,
        local_addr: &str,
        server_addr: &str,
    ) -> crate::Result<Self> {
        let server = tokio::net::lookup_host(server_addr)
            .await
            .map_err(|e| crate::Error::Config(format!("Cannot resolve '{}': {}", server_addr, e)))?
            .next()
            .ok_or_else(|| crate::Error::Config(format!("No address for '{}'", server_addr)))?;

        let socket = bind_socket(local_addr).await?;
        Ok(Self {
            context,
            socket,
            server,
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Relay between `device` and the server until cancelled
    pub async fn serve(self, device: DeviceRef) -> crate::Result<()> {
        info!(
            "UDP client {} relaying to {}",
            self.local_addr()?,
            self.server
        );

        let mut runtime = self.context.start(Arc::clone(&device));
        let relay = runtime.relay().clone();
        let dialer = Arc::new(UdpDialer::new(Arc::clone(&self.socket), self.server));
        runtime.track(relay.spawn_egress(device, Routing::Dial(dialer)));

        let mut receiver = UdpReceiver::new(Arc::clone(&self.socket), MAX_FRAME_SIZE);
        let cancel = relay.cancel_token().clone();

        loop {
            let (data, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = receiver.recv_from() => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            if from != self.server {
                debug!("Ignoring datagram from {}", from);
                continue;
            }

            if let Some(frame) = relay.deliver(&data, true).await {
                if let Some(key) = FlowKey::inbound(&frame) {
                    relay.flows().touch(&key);
                }
            }
        }

        runtime.shutdown().await;
        info!("UDP client stopped");
        Ok(())
    }
}
