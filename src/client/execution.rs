//! Execution proxy driving one test host

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

use super::proxy::{ProxyLifecycle, ProxyOperationManager, WorkerChannel};
use crate::error::{OrchestratorError, Result};
use crate::events::{MessageLevel, RunEventsHandler};
use crate::host::WorkerEvent;
use crate::models::{
    Metrics, TestRunChangedArgs, TestRunCompleteArgs, TestRunCriteria, TestRunTarget,
};
use crate::protocol::{
    ExecutionCompletePayload, Message, MessageType, TestMessagePayload, TestRunStartPayload,
};
use crate::utils::Stopwatch;

#[async_trait]
pub trait ProxyExecutionManager: ProxyLifecycle {
    /// Begin a run without waiting for it to finish
    ///
    /// `Err` means the proxy did not accept the work. Once accepted, every
    /// failure is reported through `handler` and ends in a completion.
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()>;

    /// Ask the in-flight run to stop after the current test
    async fn cancel(&self);
}

/// Report a run that never started
pub(crate) async fn report_run_setup_failure(
    handler: &dyn RunEventsHandler,
    message: String,
    elapsed: Duration,
) {
    handler
        .handle_log_message(MessageLevel::Error, message.clone())
        .await;
    handler
        .handle_test_run_complete(
            TestRunCompleteArgs::aborted(Some(message), elapsed),
            None,
            Vec::new(),
            Metrics::new(),
        )
        .await;
}

/// Runs tests in an out-of-process test host
pub struct TestHostProxyExecutionManager {
    operation: ProxyOperationManager,
}

impl TestHostProxyExecutionManager {
    pub fn new(operation: ProxyOperationManager) -> Self {
        Self { operation }
    }

    pub fn operation(&self) -> &ProxyOperationManager {
        &self.operation
    }

    async fn start_run(&self, criteria: &TestRunCriteria) -> Result<WorkerChannel> {
        let channel = self.operation.setup_channel(&criteria.sources()).await?;

        let (message_type, payload) = match &criteria.target {
            TestRunTarget::Sources(sources) => (
                MessageType::StartTestExecutionWithSources,
                TestRunStartPayload {
                    sources: sources.clone(),
                    tests: Vec::new(),
                    run_settings: criteria.run_settings.clone(),
                    test_case_filter: criteria.test_case_filter.clone(),
                    keep_alive: criteria.keep_alive,
                },
            ),
            TestRunTarget::Tests(tests) => (
                MessageType::StartTestExecutionWithTests,
                TestRunStartPayload {
                    sources: Vec::new(),
                    tests: tests.clone(),
                    run_settings: criteria.run_settings.clone(),
                    test_case_filter: None,
                    keep_alive: criteria.keep_alive,
                },
            ),
        };
        channel
            .worker
            .send(&Message::with_payload(message_type, &payload)?)
            .await?;
        Ok(channel)
    }
}

#[async_trait]
impl ProxyLifecycle for TestHostProxyExecutionManager {
    async fn initialize(&self) -> Result<()> {
        self.operation.initialize().await
    }

    async fn abort(&self) {
        let Some(worker) = self.operation.request_abort().await else {
            return;
        };
        info!("Aborting test run on proxy {}", self.operation.id());
        if let Err(e) = worker.send(&Message::new(MessageType::AbortTestRun)).await {
            warn!("Abort request failed on {}: {}; stopping test host", self.operation.id(), e);
            worker.stop().await;
        }
    }

    async fn close(&self) {
        self.operation.close().await;
    }
}

#[async_trait]
impl ProxyExecutionManager for TestHostProxyExecutionManager {
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()> {
        self.operation.begin_operation().await?;
        let stopwatch = Stopwatch::new();

        match self.start_run(&criteria).await {
            Ok(channel) => {
                let span = tracing::info_span!("execution", proxy = %self.operation.id());
                tokio::spawn(
                    listen(
                        self.operation.clone(),
                        channel,
                        handler,
                        criteria.sources(),
                        stopwatch,
                    )
                    .instrument(span),
                );
            }
            Err(e) => {
                error!("Failed to start test run on proxy {}: {}", self.operation.id(), e);
                self.operation.fail_operation().await;
                report_run_setup_failure(
                    handler.as_ref(),
                    format!(
                        "Failed to start test run for {}: {e}",
                        criteria.sources().join(", ")
                    ),
                    Duration::ZERO,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn cancel(&self) {
        if !self.operation.is_busy().await {
            return;
        }
        info!("Canceling test run on proxy {}", self.operation.id());
        if let Err(e) = self
            .operation
            .send(&Message::new(MessageType::CancelTestRun))
            .await
        {
            warn!("Cancel request failed on {}: {}", self.operation.id(), e);
        }
    }
}

async fn listen(
    operation: ProxyOperationManager,
    mut channel: WorkerChannel,
    handler: Arc<dyn RunEventsHandler>,
    sources: Vec<String>,
    stopwatch: Stopwatch,
) {
    let failure = loop {
        let message = match channel.events.recv().await {
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
                    .complete_operation(complete.complete_args.is_aborted, channel)
                    .await;
                handler
                    .handle_test_run_complete(
                        complete.complete_args,
                        complete.last_run_tests,
                        complete.run_attachments,
                        complete.metrics,
                    )
                    .await;
                return;
            }
            Err(e) => break e,
        }
    };

    let reason = if operation.abort_requested() {
        info!("Test run aborted for {}", sources.join(", "));
        None
    } else {
        warn!("Test run failed for {}: {}", sources.join(", "), failure);
        let reason = format!(
            "The active test run was aborted. Test host for {} stopped: {failure}",
            sources.join(", ")
        );
        handler
            .handle_log_message(MessageLevel::Error, reason.clone())
            .await;
        Some(reason)
    };

    operation.complete_operation(true, channel).await;
    handler
        .handle_test_run_complete(
            TestRunCompleteArgs::aborted(reason, stopwatch.elapsed()),
            None,
            Vec::new(),
            Metrics::new(),
        )
        .await;
}

async fn handle_message(
    message: &Message,
    handler: &dyn RunEventsHandler,
) -> Result<Option<ExecutionCompletePayload>> {
    match message.message_type {
        MessageType::TestRunStatsChange => {
            let args: TestRunChangedArgs = message.payload()?;
            handler.handle_test_run_stats_change(args).await;
            Ok(None)
        }
        MessageType::TestMessage => {
            let payload: TestMessagePayload = message.payload()?;
            handler
                .handle_log_message(payload.level, payload.message)
                .await;
            Ok(None)
        }
        MessageType::ExecutionComplete => Ok(Some(message.payload()?)),
        other => Err(OrchestratorError::UnexpectedMessage(other.to_string())),
    }
}
