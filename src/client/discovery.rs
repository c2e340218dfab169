//! Discovery proxy driving one test host

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use super::proxy::{ProxyLifecycle, ProxyOperationManager, WorkerChannel};
use crate::error::{OrchestratorError, Result};
use crate::events::{DiscoveryEventsHandler, MessageLevel};
use crate::host::WorkerEvent;
use crate::models::{DiscoveryCriteria, TestCase};
use crate::protocol::{
    DiscoveryCompletePayload, Message, MessageType, StartDiscoveryPayload, TestMessagePayload,
};

#[async_trait]
pub trait ProxyDiscoveryManager: ProxyLifecycle {
    /// Begin discovery without waiting for it to finish
    ///
    /// `Err` means the proxy did not accept the work. Once accepted, every
    /// failure is reported through `handler` and ends in a completion.
    async fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<()>;
}

/// Discovers tests in an out-of-process test host
pub struct TestHostProxyDiscoveryManager {
    operation: ProxyOperationManager,
}

impl TestHostProxyDiscoveryManager {
    pub fn new(operation: ProxyOperationManager) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> &ProxyOperationManager {
        &self.operation
    }

    async fn start_discovery(&self, criteria: &DiscoveryCriteria) -> Result<WorkerChannel> {
        let channel = self.operation.setup_channel(&criteria.sources).await?;
        let payload = StartDiscoveryPayload {
            sources: criteria.sources.clone(),
            run_settings: criteria.run_settings.clone(),
            test_case_filter: criteria.test_case_filter.clone(),
        };
        channel
            .worker
            .send(&Message::with_payload(MessageType::StartDiscovery, &payload)?)
            .await?;
        Ok(channel)
    }
}

#[async_trait]
impl ProxyLifecycle for TestHostProxyDiscoveryManager {
    async fn initialize(&self) -> Result<()> {
        self.operation.initialize().await
    }

    async fn abort(&self) {
        if let Some(worker) = self.operation.request_abort().await {
            info!("Aborting discovery on proxy {}", self.operation.id());
            worker.stop().await;
        }
    }

    async fn close(&self) {
        self.operation.close().await;
    }
}

#[async_trait]
impl ProxyDiscoveryManager for TestHostProxyDiscoveryManager {
    async fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<()> {
        self.operation.begin_operation().await?;

        match self.start_discovery(&criteria).await {
            Ok(channel) => {
                let span = tracing::info_span!("discovery", proxy = %self.operation.id());
                tokio::spawn(
                    listen(self.operation.clone(), channel, handler, criteria.sources)
                        .instrument(span),
                );
            }
            Err(e) => {
                error!("Failed to start discovery on proxy {}: {}", self.operation.id(), e);
                self.operation.fail_operation().await;
                handler
                    .handle_log_message(
                        MessageLevel::Error,
                        format!(
                            "Failed to start test discovery for {}: {e}",
                            criteria.sources.join(", ")
                        ),
                    )
                    .await;
                handler.handle_discovery_complete(-1, None, true).await;
            }
        }
        Ok(())
    }
}

/// Read worker events until discovery completes or the worker goes away
async fn listen(
    operation: ProxyOperationManager,
    mut channel: WorkerChannel,
    handler: Arc<dyn DiscoveryEventsHandler>,
    sources: Vec<String>,
) {
    let failure = loop {
        let event = channel.events.recv().await;
        let message = match event {
            Some(WorkerEvent::Message(message)) => message,
            Some(WorkerEvent::Connected { .. }) => continue,
            Some(WorkerEvent::Disconnected { error }) => {
                break error.unwrap_or(OrchestratorError::ConnectionClosed)
            }
            None => break OrchestratorError::ConnectionClosed,
        };

        match handle_message(&message, handler.as_ref()).await {
            Ok(None) => {}
            Ok(Some(complete)) => {
                operation
                    .complete_operation(complete.is_aborted, channel)
                    .await;
                handler
                    .handle_discovery_complete(
                        complete.total_tests,
                        complete.last_discovered_tests,
                        complete.is_aborted,
                    )
                    .await;
                return;
            }
            Err(e) => break e,
        }
    };

    if operation.abort_requested() {
        info!("Discovery aborted for {}", sources.join(", "));
    } else {
        warn!("Discovery failed for {}: {}", sources.join(", "), failure);
        handler
            .handle_log_message(
                MessageLevel::Error,
                format!(
                    "Test host for {} stopped before discovery completed: {failure}",
                    sources.join(", ")
                ),
            )
            .await;
    }
    operation.complete_operation(true, channel).await;
    handler.handle_discovery_complete(-1, None, true).await;
}

async fn handle_message(
    message: &Message,
    handler: &dyn DiscoveryEventsHandler,
) -> Result<Option<DiscoveryCompletePayload>> {
    match message.message_type {
        MessageType::TestCasesFound => {
            let tests: Vec<TestCase> = message.payload()?;
            handler.handle_discovered_tests(tests).await;
            Ok(None)
        }
        MessageType::TestMessage => {
            let payload: TestMessagePayload = message.payload()?;
            handler
                .handle_log_message(payload.level, payload.message)
                .await;
            Ok(None)
        }
        MessageType::DiscoveryComplete => Ok(Some(message.payload()?)),
        other => Err(OrchestratorError::UnexpectedMessage(other.to_string())),
    }
}
