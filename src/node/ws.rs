//! WebSocket server and client

use super::RelayContext;
use crate::transport::{accept_ws, WsDialer, WsSettings};
use crate::tunnel::{Binding, DeviceRef, Routing};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// WebSocket server: one ingress task per connection, return traffic goes
/// back over the connection a flow was learned on
pub struct WsServer {
    context: RelayContext,
    listener: TcpListener,
    settings: WsSettings,
}

impl WsServer {
    pub async fn bind(
        context: RelayContext,
        addr: &str,
        settings: WsSettings,
    ) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| crate::Error::Bind {
                addr: addr.to_string(),
                source: e,
            })?;
        Ok(Self {
            context,
            listener,
            settings,
        })
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and relay until cancelled
    pub async fn serve(self, device: DeviceRef) -> crate::Result<()> {
        info!(
            "WebSocket server listening on {}{}",
            self.local_addr()?,
            self.settings.path
        );

        let mut runtime = self.context.start(Arc::clone(&device));
        let relay = runtime.relay().clone();
        runtime.track(relay.spawn_egress(device, Routing::Lookup));
        let cancel = relay.cancel_token().clone();

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let relay = relay.clone();
            let path = self.settings.path.clone();
            let read_timeout = self.settings.read_timeout;
            tokio::spawn(async move {
                match accept_ws(stream, &path, peer.to_string(), read_timeout).await {
                    Ok((channel, receiver)) => {
                        debug!("WebSocket connection from {}", peer);
                        relay
                            .run_ingress(Arc::new(channel), Box::new(receiver), Binding::Learn)
                            .await;
                    }
                    Err(e) => debug!("Rejected connection from {}: {}", peer, e),
                }
            });
        }

        runtime.shutdown().await;
        info!("WebSocket server stopped");
        Ok(())
    }
}

/// WebSocket client: dials one connection per flow on first use
pub struct WsClient {
    context: RelayContext,
    dialer: Arc<WsDialer>,
}

impl WsClient {
    /// `secure` selects `wss://`
    pub fn new(
        context: RelayContext,
        server_addr: &str,
        secure: bool,
        settings: WsSettings,
    ) -> Self {
        Self {
            context,
            dialer: Arc::new(WsDialer::new(server_addr, secure, settings)),
        }
    }

    /// Relay until cancelled
    pub async fn serve(self, device: DeviceRef) -> crate::Result<()> {
        info!("WebSocket client relaying to {}", self.dialer.url());

        let mut runtime = self.context.start(Arc::clone(&device));
        let relay = runtime.relay().clone();
        runtime.track(relay.spawn_egress(device, Routing::Dial(self.dialer)));

        relay.cancel_token().cancelled().await;

        runtime.shutdown().await;
        info!("WebSocket client stopped");
        Ok(())
    }
}
