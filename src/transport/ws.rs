//! WebSocket transport (`ws` / `wss`)
//!
//! Every flow gets its own connection. Frames travel as binary messages;
//! anything else on the socket is ignored.

use super::{Channel, ChannelReceiver, Dialed, Dialer, TransportError};
use crate::protocol::FlowKey;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// WebSocket endpoint settings
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// Request path the server accepts upgrades on
    pub path: String,
    /// User-Agent sent by the client
    pub user_agent: String,
    /// A connection with no inbound message for this long is ended
    pub read_timeout: Duration,
    /// Dial timeout
    pub connect_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            path: "/way-to-freedom".to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/88.0.4324.182 Safari/537.36".to_string(),
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Sending half of a WebSocket connection
pub struct WsChannel<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    label: String,
    closed: AtomicBool,
}

/// Receiving half of a WebSocket connection
pub struct WsReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    label: String,
    read_timeout: Duration,
}

/// Split an established connection into channel and receiver
pub fn split<S>(
    ws: WebSocketStream<S>,
    label: String,
    read_timeout: Duration,
) -> (WsChannel<S>, WsReceiver<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        WsChannel {
            sink: Mutex::new(sink),
            label: label.clone(),
            closed: AtomicBool::new(false),
        },
        WsReceiver {
            stream,
            label,
            read_timeout,
        },
    )
}

/// Complete the server side of the upgrade, accepting only `path`
pub async fn accept<S>(
    stream: S,
    path: &str,
    label: String,
    read_timeout: Duration,
) -> Result<(WsChannel<S>, WsReceiver<S>), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = path.to_string();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some("not found".to_string()));
            *err.status_mut() = StatusCode::NOT_FOUND;
            Err(err)
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    Ok(split(ws, label, read_timeout))
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }

    fn peer(&self) -> &str {
        &self.label
    }
}

#[async_trait]
impl<S> ChannelReceiver for WsReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            let next = match tokio::time::timeout(self.read_timeout, self.stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    debug!("{}: read timeout", self.label);
                    return None;
                }
            };

            match next? {
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// Opens one WebSocket connection per flow
pub struct WsDialer {
    url: String,
    settings: WsSettings,
}

impl WsDialer {
    /// `secure` selects `wss://`
    pub fn new(server_addr: &str, secure: bool, settings: WsSettings) -> Self {
        let scheme = if secure { "wss" } else { "ws" };
        Self {
            url: format!("{}://{}{}", scheme, server_addr, settings.path),
            settings,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, key: &FlowKey) -> Result<Dialed, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        let agent = HeaderValue::from_str(&self.settings.user_agent)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let (ws, _) = tokio::time::timeout(
            self.settings.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        debug!("Dialed {} for flow {}", self.url, key);

        let (channel, receiver) = split(ws, self.url.clone(), self.settings.read_timeout);
        Ok(Dialed {
            channel: Arc::new(channel),
            receiver: Some(Box::new(receiver)),
        })
    }
}
