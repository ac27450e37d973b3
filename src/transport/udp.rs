//! UDP transport
//!
//! One socket carries every flow. A channel is just the socket paired with a
//! remote address, so opening one never touches the network.

use super::{Channel, ChannelReceiver, Dialed, Dialer, TransportError};
use crate::protocol::FlowKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Datagram channel to a single remote address
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    label: String,
    closed: AtomicBool,
}

impl UdpChannel {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self {
            socket,
            remote,
            label: format!("udp://{}", remote),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote socket address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.socket.send_to(data, self.remote).await?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        // The socket is shared with every other flow; only this handle goes away.
        self.closed.store(true, Ordering::Release);
    }

    fn peer(&self) -> &str {
        &self.label
    }
}

/// Reads datagrams from a shared socket
pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpReceiver {
    pub fn new(socket: Arc<UdpSocket>, buffer_size: usize) -> Self {
        Self {
            socket,
            buf: vec![0u8; buffer_size],
        }
    }

    /// Receive one non-empty datagram together with its sender
    pub async fn recv_from(&mut self) -> Result<(Bytes, SocketAddr), TransportError> {
        loop {
            let (n, from) = self.socket.recv_from(&mut self.buf).await?;
            if n == 0 {
                continue;
            }
            return Ok((Bytes::copy_from_slice(&self.buf[..n]), from));
        }
    }
}

#[async_trait]
impl ChannelReceiver for UdpReceiver {
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        Some(self.recv_from().await.map(|(data, _)| data))
    }
}

/// Hands out channels to a fixed server over a shared socket
pub struct UdpDialer {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
}

impl UdpDialer {
    pub fn new(socket: Arc<UdpSocket>, server: SocketAddr) -> Self {
        Self { socket, server }
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self, _key: &FlowKey) -> Result<Dialed, TransportError> {
        Ok(Dialed {
            channel: Arc::new(UdpChannel::new(Arc::clone(&self.socket), self.server)),
            receiver: None,
        })
    }
}
