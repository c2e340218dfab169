//! In-process execution proxy
//!
//! Runs tests through an [`ExecutionEngine`] living in the controller
//! process. There is no test host to release, so closing is a no-op.
//! The proxy stays busy until the engine reports run completion, which may
//! happen long after `start_test_run` returned.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::execution::{report_run_setup_failure, ProxyExecutionManager};
use super::proxy::{ProxyLifecycle, ProxyState};
use crate::error::{OrchestratorError, Result};
use crate::events::{MessageLevel, RunEventsHandler};
use crate::models::{
    AttachmentSet, Metrics, TestRunChangedArgs, TestRunCompleteArgs, TestRunCriteria,
    TestRunTarget,
};

/// Executes tests inside the current process
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    /// Run the tests, reporting progress and completion to `handler`
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()>;

    async fn cancel(&self);

    async fn abort(&self);
}

pub struct InProcessProxyExecutionManager {
    engine: Arc<dyn ExecutionEngine>,
    state: Arc<Mutex<ProxyState>>,
}

impl InProcessProxyExecutionManager {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            engine,
            state: Arc::new(Mutex::new(ProxyState::Created)),
        }
    }

    pub async fn state(&self) -> ProxyState {
        *self.state.lock().await
    }
}

/// Explicit tests are handed to the engine grouped by source
fn grouped_by_source(criteria: TestRunCriteria) -> TestRunCriteria {
    if !criteria.has_specific_tests() {
        return criteria;
    }
    let tests = criteria
        .tests_by_source()
        .into_iter()
        .flat_map(|(_, tests)| tests)
        .collect();
    criteria.retarget(TestRunTarget::Tests(tests))
}

/// Leaves the busy state when the engine reports the run complete
struct InProcessRunEventsHandler {
    state: Arc<Mutex<ProxyState>>,
    actual: Arc<dyn RunEventsHandler>,
}

#[async_trait]
impl RunEventsHandler for InProcessRunEventsHandler {
    async fn handle_test_run_stats_change(&self, args: TestRunChangedArgs) {
        self.actual.handle_test_run_stats_change(args).await;
    }

    async fn handle_test_run_complete(
        &self,
        complete: TestRunCompleteArgs,
        last_chunk: Option<TestRunChangedArgs>,
        attachments: Vec<AttachmentSet>,
        metrics: Metrics,
    ) {
        {
            let mut state = self.state.lock().await;
            if *state == ProxyState::Busy {
                *state = if complete.is_aborted {
                    ProxyState::Aborted
                } else {
                    ProxyState::Completed
                };
            }
        }
        self.actual
            .handle_test_run_complete(complete, last_chunk, attachments, metrics)
            .await;
    }

    async fn handle_log_message(&self, level: MessageLevel, message: String) {
        self.actual.handle_log_message(level, message).await;
    }
}

#[async_trait]
impl ProxyLifecycle for InProcessProxyExecutionManager {
    async fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == ProxyState::Created {
            self.engine.initialize().await?;
            *state = ProxyState::Initialized;
        }
        Ok(())
    }

    async fn abort(&self) {
        if *self.state.lock().await == ProxyState::Busy {
            self.engine.abort().await;
        }
    }

    async fn close(&self) {
        debug!("In-process proxy has nothing to close");
    }
}

#[async_trait]
impl ProxyExecutionManager for InProcessProxyExecutionManager {
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()> {
        let needs_initialize = {
            let mut state = self.state.lock().await;
            if *state == ProxyState::Busy {
                return Err(OrchestratorError::InvalidState(
                    "In-process test run already in progress".to_string(),
                ));
            }
            let created = *state == ProxyState::Created;
            *state = ProxyState::Busy;
            created
        };

        let sources = criteria.sources();
        let tracking: Arc<dyn RunEventsHandler> = Arc::new(InProcessRunEventsHandler {
            state: Arc::clone(&self.state),
            actual: Arc::clone(&handler),
        });
        let outcome = async {
            if needs_initialize {
                self.engine.initialize().await?;
            }
            self.engine
                .start_test_run(grouped_by_source(criteria), tracking)
                .await
        }
        .await;

        match outcome {
            Ok(()) => debug!("In-process test run started for {}", sources.join(", ")),
            Err(e) => {
                *self.state.lock().await = ProxyState::Aborted;
                error!("In-process test run failed to start: {}", e);
                report_run_setup_failure(
                    handler.as_ref(),
                    format!("Failed to run tests in process for {}: {e}", sources.join(", ")),
                    Duration::ZERO,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn cancel(&self) {
        if *self.state.lock().await == ProxyState::Busy {
            self.engine.cancel().await;
        }
    }
}
