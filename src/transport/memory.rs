//! In-memory transport pair used by tests

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use super::Transport;
use crate::error::{OrchestratorError, Result};
use crate::protocol::Message;

pub struct MemoryTransport {
    tx: Mutex<Option<UnboundedSender<Message>>>,
    rx: Mutex<UnboundedReceiver<Message>>,
    refuse_connections: bool,
}

impl MemoryTransport {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        (Self::end(a_tx, b_rx, false), Self::end(b_tx, a_rx, false))
    }

    /// An end whose `connect` always fails
    pub fn refusing() -> Self {
        let (tx, rx) = unbounded_channel();
        Self::end(tx, rx, true)
    }

    fn end(
        tx: UnboundedSender<Message>,
        rx: UnboundedReceiver<Message>,
        refuse_connections: bool,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            refuse_connections,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &str) -> Result<String> {
        if self.refuse_connections {
            return Err(OrchestratorError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(endpoint.to_string())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(OrchestratorError::ConnectionClosed)?;
        tx.send(message.clone())
            .map_err(|_| OrchestratorError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<Message> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(OrchestratorError::ConnectionClosed)
    }

    async fn disconnect(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}
