//! Channel for per-test-case events
//!
//! Test case start/end events arrive on their own connection from the test
//! host so they never queue behind session messages.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::manager::DataCollectionManager;
use crate::error::{OrchestratorError, Result};
use crate::protocol::{Message, MessageType, TestCaseEndResultPayload, TestCaseEventPayload};
use crate::transport::{TcpServer, TcpTransport, Transport};

#[async_trait]
pub trait TestCaseEventsHandler: Send + Sync {
    /// Start listening; returns the port the test host should connect to
    async fn initialize_communication(&self) -> Result<u16>;

    /// Wait for the test host to connect; false on timeout
    async fn wait_for_request_handler_connection(&self, timeout: Duration) -> bool;

    /// Serve events until the test host ends the session
    async fn process_requests(&self) -> Result<()>;

    async fn close(&self);
}

/// Serves test case events from one test host over TCP
pub struct DataCollectionTestCaseEventHandler {
    manager: Arc<dyn DataCollectionManager>,
    server: Mutex<Option<TcpServer>>,
    connection: Mutex<Option<Arc<TcpTransport>>>,
}

impl DataCollectionTestCaseEventHandler {
    pub fn new(manager: Arc<dyn DataCollectionManager>) -> Self {
        Self {
            manager,
            server: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    async fn handle(&self, connection: &TcpTransport, message: Message) -> Result<bool> {
        match message.message_type {
            MessageType::TestCaseStart => {
                let event: TestCaseEventPayload = message.payload()?;
                self.manager.test_case_started(&event).await;
                Ok(true)
            }
            MessageType::TestCaseEnd => {
                let event: TestCaseEventPayload = message.payload()?;
                let attachment_sets = self.manager.test_case_ended(&event).await;
                connection
                    .send(&Message::with_payload(
                        MessageType::TestCaseEndResult,
                        &TestCaseEndResultPayload { attachment_sets },
                    )?)
                    .await?;
                Ok(true)
            }
            MessageType::SessionEnd => Ok(false),
            other => Err(OrchestratorError::UnexpectedMessage(other.to_string())),
        }
    }
}

#[async_trait]
impl TestCaseEventsHandler for DataCollectionTestCaseEventHandler {
    async fn initialize_communication(&self) -> Result<u16> {
        let server = TcpServer::bind("127.0.0.1:0").await?;
        let port = server.port();
        *self.server.lock().await = Some(server);
        Ok(port)
    }

    async fn wait_for_request_handler_connection(&self, timeout: Duration) -> bool {
        let server = self.server.lock().await;
        let Some(server) = server.as_ref() else {
            warn!("Test case event channel was never initialized");
            return false;
        };
        match server.accept(timeout).await {
            Ok(connection) => {
                *self.connection.lock().await = Some(Arc::new(connection));
                true
            }
            Err(e) => {
                warn!("Test host did not connect for test case events: {}", e);
                false
            }
        }
    }

    async fn process_requests(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| {
                OrchestratorError::InvalidState("Test case event channel is not connected".into())
            })?;

        loop {
            let message = connection.receive().await?;
            if !self.handle(&connection, message).await? {
                debug!("Test case event session ended");
                return Ok(());
            }
        }
    }

    async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(e) = connection.disconnect().await {
                debug!("Closing test case event channel: {}", e);
            }
        }
        self.server.lock().await.take();
    }
}
