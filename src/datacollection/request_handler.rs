//! Worker-side data collection session
//!
//! Serves one session from the controller:
//! `AwaitingSessionStart -> SessionActive -> AwaitingSessionEnd -> Terminated`.
//! Only receiving suspends the loop. Any receive or dispatch failure ends it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

use super::manager::DataCollectionManager;
use super::test_case_events::TestCaseEventsHandler;
use crate::config::{connection_timeout, OrchestratorConfig, CONNECTION_TIMEOUT_ENV};
use crate::error::{OrchestratorError, Result};
use crate::events::MessageLevel;
use crate::protocol::{
    AfterTestRunEndPayload, AfterTestRunEndResultPayload, BeforeTestRunStartPayload,
    BeforeTestRunStartResultPayload, DataCollectionMessagePayload, Message, MessageType,
    TestHostLaunchedPayload,
};
use crate::transport::Transport;

const DATACOLLECTOR_PROCESS: &str = "datacollector";
const TESTHOST_PROCESS: &str = "testhost";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    AwaitingSessionStart,
    SessionActive,
    AwaitingSessionEnd,
    Terminated,
}

pub struct DataCollectionRequestHandler {
    transport: Arc<dyn Transport>,
    manager: Arc<dyn DataCollectionManager>,
    test_case_events: Arc<dyn TestCaseEventsHandler>,
    connection_timeout: Duration,
    state: Mutex<HandlerState>,
    session_id: Mutex<Option<Uuid>>,
    test_case_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl DataCollectionRequestHandler {
    pub fn new(
        transport: Arc<dyn Transport>,
        manager: Arc<dyn DataCollectionManager>,
        test_case_events: Arc<dyn TestCaseEventsHandler>,
    ) -> Self {
        Self {
            transport,
            manager,
            test_case_events,
            connection_timeout: connection_timeout(),
            state: Mutex::new(HandlerState::AwaitingSessionStart),
            session_id: Mutex::new(None),
            test_case_task: Mutex::new(None),
        }
    }

    /// Handler waiting as long as `config.connection_timeout_secs`
    pub fn from_config(
        transport: Arc<dyn Transport>,
        manager: Arc<dyn DataCollectionManager>,
        test_case_events: Arc<dyn TestCaseEventsHandler>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self::new(transport, manager, test_case_events)
            .with_connection_timeout(config.connection_timeout())
    }

    /// Override how long the test case event channel waits for the test host
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub async fn state(&self) -> HandlerState {
        *self.state.lock().await
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        *self.session_id.lock().await
    }

    /// Connect to the controller listening on the loopback `port`
    pub async fn initialize_communication(&self, port: u16) -> Result<String> {
        self.transport
            .connect(&format!("127.0.0.1:{port}"))
            .await
    }

    pub async fn send_data_collection_message(
        &self,
        level: MessageLevel,
        message: impl Into<String>,
        data_collector_uri: Option<String>,
    ) -> Result<()> {
        let payload = DataCollectionMessagePayload {
            level,
            message: message.into(),
            data_collector_uri,
        };
        self.transport
            .send(&Message::with_payload(MessageType::DataCollectionMessage, &payload)?)
            .await
    }

    /// Run the message loop on its own task
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<()>> {
        let span = tracing::info_span!("datacollection");
        tokio::spawn(async move { self.process_requests().await }.instrument(span))
    }

    /// Serve controller messages until the session ends
    pub async fn process_requests(&self) -> Result<()> {
        loop {
            let message = self.transport.receive().await?;
            debug!("Data collection received {}", message.message_type);

            match message.message_type {
                MessageType::BeforeTestRunStart => self.handle_before_test_run_start(&message).await?,
                MessageType::TestHostLaunched => {
                    let payload: TestHostLaunchedPayload = message.payload()?;
                    self.manager.test_host_launched(payload.process_id).await;
                }
                MessageType::AfterTestRunEnd => {
                    return self.handle_after_test_run_end(&message).await;
                }
                other => return Err(OrchestratorError::UnexpectedMessage(other.to_string())),
            }
        }
    }

    async fn handle_before_test_run_start(&self, message: &Message) -> Result<()> {
        let payload: BeforeTestRunStartPayload = message.payload()?;
        *self.state.lock().await = HandlerState::SessionActive;
        let session_id = Uuid::new_v4();
        *self.session_id.lock().await = Some(session_id);
        info!("Data collection session {} started for {} sources", session_id, payload.sources.len());

        let environment_variables = self.manager.load_data_collectors(&payload.settings).await;
        let are_test_case_events_required = self.manager.session_started().await;

        let mut data_collection_events_port = 0;
        if are_test_case_events_required {
            data_collection_events_port = self.test_case_events.initialize_communication().await?;
            *self.test_case_task.lock().await = Some(self.spawn_test_case_events());
        }

        let result = BeforeTestRunStartResultPayload {
            environment_variables,
            are_test_case_events_required,
            data_collection_events_port,
        };
        self.transport
            .send(&Message::with_payload(MessageType::BeforeTestRunStartResult, &result)?)
            .await
    }

    fn spawn_test_case_events(&self) -> JoinHandle<Result<()>> {
        let events = Arc::clone(&self.test_case_events);
        let timeout = self.connection_timeout;
        tokio::spawn(
            async move {
                if !events.wait_for_request_handler_connection(timeout).await {
                    return Err(OrchestratorError::ConnectionTimeout {
                        client: DATACOLLECTOR_PROCESS.to_string(),
                        server: TESTHOST_PROCESS.to_string(),
                        timeout_secs: timeout.as_secs(),
                        env_var: CONNECTION_TIMEOUT_ENV.to_string(),
                    });
                }
                events.process_requests().await
            }
            .instrument(tracing::debug_span!("test_case_events")),
        )
    }

    async fn handle_after_test_run_end(&self, message: &Message) -> Result<()> {
        let payload: AfterTestRunEndPayload = message.payload()?;
        *self.state.lock().await = HandlerState::AwaitingSessionEnd;

        let task = self.test_case_task.lock().await.take();
        if let Some(task) = task {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(OrchestratorError::InvalidState(format!(
                    "Test case event handler panicked: {e}"
                ))),
            };
            if let Err(e) = outcome {
                self.terminate().await;
                return Err(OrchestratorError::Aggregate(vec![e]));
            }
        }

        let attachment_sets = self.manager.session_ended(payload.is_cancelled).await;
        info!(
            "Data collection session ended (cancelled: {}, attachments: {})",
            payload.is_cancelled,
            attachment_sets.len()
        );
        let result = AfterTestRunEndResultPayload {
            attachment_sets,
            ..Default::default()
        };
        let sent = self
            .transport
            .send(&Message::with_payload(MessageType::AfterTestRunEndResult, &result)?)
            .await;
        self.terminate().await;
        sent
    }

    async fn terminate(&self) {
        self.test_case_events.close().await;
        self.manager.dispose().await;
        *self.state.lock().await = HandlerState::Terminated;
    }

    pub async fn close(&self) -> Result<()> {
        debug!("Closing data collection channel");
        self.transport.disconnect().await
    }
}
