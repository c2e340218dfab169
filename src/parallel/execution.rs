//! Parallel test execution across a pool of proxies
//!
//! A run is split into one unit per source (or per source's group of
//! explicit tests). Partial completions are merged into a single run
//! completion once the last unit in flight reports back.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::aggregator::RunDataAggregator;
use super::operation::{ParallelOperationManager, ProxyFactory};
use super::request::{RequestTracker, StopRequest};
use super::work::WorkItem;
use crate::client::{ProxyExecutionManager, ProxyLifecycle};
use crate::error::{OrchestratorError, Result};
use crate::events::{MessageLevel, RunEventsHandler};
use crate::models::{
    AttachmentSet, Metrics, TestRunChangedArgs, TestRunCompleteArgs, TestRunCriteria,
    TestRunStatistics, TestRunTarget,
};

type ExecutionProxy = Arc<dyn ProxyExecutionManager>;

struct RunContext {
    id: u64,
    trace_id: Uuid,
    criteria: TestRunCriteria,
    handler: Arc<dyn RunEventsHandler>,
}

impl RunContext {
    fn criteria_for(&self, item: &WorkItem) -> TestRunCriteria {
        match item {
            WorkItem::Source(source) => self
                .criteria
                .retarget(TestRunTarget::Sources(vec![source.clone()])),
            WorkItem::Tests { tests, .. } => {
                self.criteria.retarget(TestRunTarget::Tests(tests.clone()))
            }
        }
    }
}

type RunState = RequestTracker<RunContext, RunDataAggregator>;

fn work_items(criteria: &TestRunCriteria) -> Vec<WorkItem> {
    match &criteria.target {
        TestRunTarget::Sources(_) => criteria.sources().into_iter().map(WorkItem::Source).collect(),
        TestRunTarget::Tests(_) => criteria
            .tests_by_source()
            .into_iter()
            .map(|(source, tests)| WorkItem::Tests { source, tests })
            .collect(),
    }
}

pub struct ParallelProxyExecutionManager {
    me: Weak<Self>,
    pool: ParallelOperationManager<dyn ProxyExecutionManager>,
    dispatch_retry_limit: usize,
    state: Mutex<RunState>,
}

impl ParallelProxyExecutionManager {
    pub fn new(
        factory: ProxyFactory<dyn ProxyExecutionManager>,
        parallel_level: usize,
        shared_hosts: bool,
        dispatch_retry_limit: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pool: ParallelOperationManager::new(factory, parallel_level, shared_hosts),
            dispatch_retry_limit,
            state: Mutex::new(RunState::default()),
        })
    }

    pub fn pool(&self) -> &ParallelOperationManager<dyn ProxyExecutionManager> {
        &self.pool
    }

    pub async fn is_in_progress(&self) -> bool {
        self.state.lock().await.is_in_progress()
    }

    pub async fn update_parallel_level(&self, level: usize) -> Result<()> {
        if self.is_in_progress().await {
            return Err(OrchestratorError::InvalidState(
                "Cannot change parallel level while a test run is in progress".to_string(),
            ));
        }
        self.pool.update_parallel_level(level).await;
        Ok(())
    }

    /// Fold one proxy's run completion into the overall run
    ///
    /// Returns true when this completion finished the whole run.
    pub async fn handle_partial_run_complete(
        &self,
        proxy: &ExecutionProxy,
        request_id: u64,
        complete: TestRunCompleteArgs,
        last_chunk: Option<TestRunChangedArgs>,
        attachments: Vec<AttachmentSet>,
        metrics: Metrics,
    ) -> bool {
        let Some(context) = self.state.lock().await.context(request_id) else {
            debug!("Ignoring completion for stale run {}", request_id);
            return false;
        };

        if let Some(chunk) = last_chunk {
            context.handler.handle_test_run_stats_change(chunk).await;
        }

        let next_proxy = if complete.is_aborted || !self.pool.shared_hosts() {
            self.pool.replace_manager(proxy).await
        } else {
            Some(Arc::clone(proxy))
        };
        self.complete_unit(&context, (complete, attachments, metrics), next_proxy)
            .await
    }

    async fn complete_unit(
        &self,
        context: &Arc<RunContext>,
        partial: (TestRunCompleteArgs, Vec<AttachmentSet>, Metrics),
        next_proxy: Option<ExecutionProxy>,
    ) -> bool {
        let (next, finished) = {
            let mut state = self.state.lock().await;
            if !state.is_current(context.id) {
                return false;
            }
            let (complete, attachments, metrics) = partial;
            state
                .aggregator_mut()
                .aggregate(&complete, attachments, metrics);
            let unit = state.complete_unit(next_proxy);

            let finished = unit.finished.then(|| {
                let canceled = state.cancel_requested();
                let aborted = state.abort_requested() || (!canceled && state.has_pending());
                state.finish();
                let aggregator = state.aggregator_mut();
                if canceled {
                    aggregator.mark_canceled();
                }
                if aborted {
                    aggregator.mark_aborted();
                }
                aggregator.finish()
            });
            (unit.next, finished)
        };

        if let Some((proxy, item)) = next {
            self.dispatch(proxy, item, Arc::clone(context));
        }

        match finished {
            Some((complete, attachments, metrics)) => {
                info!(
                    "Test run {} complete: {} (canceled: {}, aborted: {})",
                    context.trace_id, complete.stats, complete.is_canceled, complete.is_aborted
                );
                context
                    .handler
                    .handle_test_run_complete(complete, None, attachments, metrics)
                    .await;
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, proxy: ExecutionProxy, item: WorkItem, context: Arc<RunContext>) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let span = tracing::debug_span!(
            "execute",
            request = %context.trace_id,
            source = %item.source()
        );

        tokio::spawn(
            async move {
                let handler: Arc<dyn RunEventsHandler> = Arc::new(ParallelRunEventsHandler {
                    manager: Arc::clone(&manager),
                    proxy: Arc::clone(&proxy),
                    request_id: context.id,
                    actual: Arc::clone(&context.handler),
                });
                let criteria = context.criteria_for(&item);

                let accepted = match proxy.initialize().await {
                    Ok(()) => proxy.start_test_run(criteria, handler).await,
                    Err(e) => Err(e),
                };
                match accepted {
                    Ok(()) => manager.forward_pending_stop(&proxy, context.id).await,
                    Err(e) => manager.handle_dispatch_failure(proxy, item, context, e).await,
                }
            }
            .instrument(span),
        );
    }

    /// A stop broadcast while the unit was being handed over found the
    /// proxy idle; pass it on now that the proxy owns the unit
    async fn forward_pending_stop(&self, proxy: &ExecutionProxy, request_id: u64) {
        let pending = self.state.lock().await.pending_stop(request_id);
        match pending {
            Some(StopRequest::Abort) => {
                debug!("Forwarding abort to a proxy that just accepted its unit");
                proxy.abort().await;
            }
            Some(StopRequest::Cancel) => {
                debug!("Forwarding cancel to a proxy that just accepted its unit");
                proxy.cancel().await;
            }
            None => {}
        }
    }

    async fn handle_dispatch_failure(
        &self,
        proxy: ExecutionProxy,
        item: WorkItem,
        context: Arc<RunContext>,
        error: OrchestratorError,
    ) {
        warn!("Failed to dispatch test run of {}: {}", item.source(), error);
        let replacement = self.pool.replace_manager(&proxy).await;

        let retry = {
            let mut state = self.state.lock().await;
            if !state.is_current(context.id) {
                return;
            }
            state.retry(item.clone(), self.dispatch_retry_limit, replacement.as_ref())
        };

        match retry {
            Some((replacement, next)) => {
                debug!("Retrying test run of {} on a fresh proxy", next.source());
                self.dispatch(replacement, next, context);
            }
            None => {
                let message = format!("Failed to run tests in {}: {error}", item.source());
                context
                    .handler
                    .handle_log_message(MessageLevel::Error, message.clone())
                    .await;
                let partial = TestRunCompleteArgs::aborted(Some(message), Duration::ZERO);
                self.complete_unit(&context, (partial, Vec::new(), Metrics::new()), replacement)
                    .await;
            }
        }
    }

    async fn broadcast_stop(&self, stop: StopRequest) {
        let result = if stop == StopRequest::Cancel {
            self.pool
                .do_action_on_all_managers(
                    |proxy: ExecutionProxy| async move {
                        proxy.cancel().await;
                        Ok(())
                    },
                    true,
                )
                .await
        } else {
            self.pool
                .do_action_on_all_managers(
                    |proxy: ExecutionProxy| async move {
                        proxy.abort().await;
                        Ok(())
                    },
                    true,
                )
                .await
        };
        if let Err(e) = result {
            warn!("Stopping test run failed on some proxies: {}", e);
        }
    }
}

#[async_trait]
impl ProxyLifecycle for ParallelProxyExecutionManager {
    async fn initialize(&self) -> Result<()> {
        self.pool
            .do_action_on_all_managers(|proxy: ExecutionProxy| async move { proxy.initialize().await }, true)
            .await
    }

    async fn abort(&self) {
        if !self.state.lock().await.request_stop(StopRequest::Abort) {
            return;
        }
        info!("Aborting parallel test run");
        self.broadcast_stop(StopRequest::Abort).await;
    }

    async fn close(&self) {
        if !self.state.lock().await.close() {
            return;
        }
        let _ = self
            .pool
            .do_action_on_all_managers(
                |proxy: ExecutionProxy| async move {
                    proxy.close().await;
                    Ok(())
                },
                false,
            )
            .await;
    }
}

#[async_trait]
impl ProxyExecutionManager for ParallelProxyExecutionManager {
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.is_closed() {
                return Err(OrchestratorError::InvalidState(
                    "Parallel execution manager is closed".to_string(),
                ));
            }
            if state.is_in_progress() {
                return Err(OrchestratorError::InvalidState(
                    "A test run is already in progress".to_string(),
                ));
            }
        }
        self.initialize().await?;

        let items = work_items(&criteria);
        if items.is_empty() {
            handler
                .handle_test_run_complete(
                    TestRunCompleteArgs::completed(TestRunStatistics::new(), Duration::ZERO),
                    None,
                    Vec::new(),
                    Metrics::new(),
                )
                .await;
            return Ok(());
        }

        let managers = self.pool.managers().await;
        let unit_count = items.len();
        let (context, batch) = {
            let mut state = self.state.lock().await;
            if state.is_in_progress() {
                return Err(OrchestratorError::InvalidState(
                    "A test run is already in progress".to_string(),
                ));
            }
            let id = state.next_id();
            let context = Arc::new(RunContext {
                id,
                trace_id: Uuid::new_v4(),
                criteria,
                handler,
            });
            let batch = state.begin(id, Arc::clone(&context), items, managers);
            (context, batch)
        };

        info!(
            "Test run {}: {} units on {} proxies",
            context.trace_id,
            unit_count,
            batch.len()
        );
        for (proxy, item) in batch {
            self.dispatch(proxy, item, Arc::clone(&context));
        }
        Ok(())
    }

    /// Cancel in-flight units and stop handing out new ones
    async fn cancel(&self) {
        if !self.state.lock().await.request_stop(StopRequest::Cancel) {
            return;
        }
        info!("Canceling parallel test run");
        self.broadcast_stop(StopRequest::Cancel).await;
    }
}

struct ParallelRunEventsHandler {
    manager: Arc<ParallelProxyExecutionManager>,
    proxy: ExecutionProxy,
    request_id: u64,
    actual: Arc<dyn RunEventsHandler>,
}

#[async_trait]
impl RunEventsHandler for ParallelRunEventsHandler {
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
        self.manager
            .handle_partial_run_complete(
                &self.proxy,
                self.request_id,
                complete,
                last_chunk,
                attachments,
                metrics,
            )
            .await;
    }

    async fn handle_log_message(&self, level: MessageLevel, message: String) {
        self.actual.handle_log_message(level, message).await;
    }
}
