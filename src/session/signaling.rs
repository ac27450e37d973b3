//! Out-of-band descriptor exchange
//!
//! Signaling only ever sees encoded descriptor text. How that text gets to
//! the other side (an operator pasting it, a file, a rendezvous service) is
//! up to the implementation.

use super::SessionError;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;

/// Carries encoded session descriptors between the two ends
#[async_trait]
pub trait Signaling: Send {
    /// Hand the local descriptor to the other side
    async fn publish(&mut self, descriptor: &str) -> Result<(), SessionError>;

    /// Wait for the remote descriptor
    async fn await_remote(&mut self) -> Result<String, SessionError>;
}

/// Prints the local descriptor and reads the remote one from stdin
pub struct ConsoleSignaling {
    lines: Lines<BufReader<Stdin>>,
}

impl ConsoleSignaling {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for ConsoleSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Signaling for ConsoleSignaling {
    async fn publish(&mut self, descriptor: &str) -> Result<(), SessionError> {
        let mut stdout = tokio::io::stdout();
        let text = format!("\nSession descriptor (send this to the other side):\n{}\n\n", descriptor);
        stdout
            .write_all(text.as_bytes())
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }

    async fn await_remote(&mut self) -> Result<String, SessionError> {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(b"Paste the remote descriptor:\n").await;
        let _ = stdout.flush().await;

        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(line.trim().to_string()),
                Ok(None) => {
                    return Err(SessionError::Signaling(
                        "stdin closed before a descriptor was entered".to_string(),
                    ))
                }
                Err(e) => return Err(SessionError::Signaling(e.to_string())),
            }
        }
    }
}

/// In-process signaling over a pair of queues
pub struct ChannelSignaling {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl ChannelSignaling {
    /// Two connected ends: what one publishes, the other awaits
    pub fn pair() -> (ChannelSignaling, ChannelSignaling) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            ChannelSignaling { tx: a_tx, rx: b_rx },
            ChannelSignaling { tx: b_tx, rx: a_rx },
        )
    }
}

#[async_trait]
impl Signaling for ChannelSignaling {
    async fn publish(&mut self, descriptor: &str) -> Result<(), SessionError> {
        self.tx
            .send(descriptor.to_string())
            .map_err(|_| SessionError::Signaling("remote end gone".to_string()))
    }

    async fn await_remote(&mut self) -> Result<String, SessionError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| SessionError::Signaling("remote end gone".to_string()))
    }
}
