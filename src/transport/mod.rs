//! Message transport
//!
//! A transport is a bidirectional channel of [`Message`]s. Sends and
//! receives may run concurrently on a shared transport, so implementations
//! keep their read and write halves independently synchronized.

pub mod tcp;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::Message;

pub use tcp::{reserve_local_endpoint, TcpServer, TcpTransport};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint`, returning the resolved endpoint
    async fn connect(&self, endpoint: &str) -> Result<String>;

    async fn send(&self, message: &Message) -> Result<()>;

    /// Wait for the next message; `ConnectionClosed` once the peer is gone
    async fn receive(&self) -> Result<Message>;

    async fn disconnect(&self) -> Result<()>;
}
