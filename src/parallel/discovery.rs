//! Parallel discovery across a pool of proxies
//!
//! Sources are queued and handed out one per proxy. Each proxy reports its
//! partial completion through a per-proxy handler; the manager aggregates
//! partials, hands the proxy its next source and reports a single
//! completion once nothing is left in flight.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::aggregator::DiscoveryDataAggregator;
use super::operation::{ParallelOperationManager, ProxyFactory};
use super::request::{RequestTracker, StopRequest};
use super::work::WorkItem;
use crate::client::{ProxyDiscoveryManager, ProxyLifecycle};
use crate::error::{OrchestratorError, Result};
use crate::events::{DiscoveryEventsHandler, MessageLevel};
use crate::models::{DiscoveryCriteria, TestCase};

type DiscoveryProxy = Arc<dyn ProxyDiscoveryManager>;

struct RequestContext {
    id: u64,
    trace_id: Uuid,
    criteria: DiscoveryCriteria,
    handler: Arc<dyn DiscoveryEventsHandler>,
}

type RequestState = RequestTracker<RequestContext, DiscoveryDataAggregator>;

pub struct ParallelProxyDiscoveryManager {
    me: Weak<Self>,
    pool: ParallelOperationManager<dyn ProxyDiscoveryManager>,
    dispatch_retry_limit: usize,
    state: Mutex<RequestState>,
}

impl ParallelProxyDiscoveryManager {
    pub fn new(
        factory: ProxyFactory<dyn ProxyDiscoveryManager>,
        parallel_level: usize,
        shared_hosts: bool,
        dispatch_retry_limit: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pool: ParallelOperationManager::new(factory, parallel_level, shared_hosts),
            dispatch_retry_limit,
            state: Mutex::new(RequestState::default()),
        })
    }

    pub fn pool(&self) -> &ParallelOperationManager<dyn ProxyDiscoveryManager> {
        &self.pool
    }

    pub async fn is_in_progress(&self) -> bool {
        self.state.lock().await.is_in_progress()
    }

    /// Resize the pool between requests
    pub async fn update_parallel_level(&self, level: usize) -> Result<()> {
        if self.is_in_progress().await {
            return Err(OrchestratorError::InvalidState(
                "Cannot change parallel level while discovery is in progress".to_string(),
            ));
        }
        self.pool.update_parallel_level(level).await;
        Ok(())
    }

    /// Fold one proxy's completion into the request
    ///
    /// Returns true when this completion finished the whole request.
    pub async fn handle_partial_discovery_complete(
        &self,
        proxy: &DiscoveryProxy,
        request_id: u64,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    ) -> bool {
        let Some(context) = self.state.lock().await.context(request_id) else {
            debug!("Ignoring completion for stale discovery request {}", request_id);
            return false;
        };

        if let Some(chunk) = last_chunk.filter(|chunk| !chunk.is_empty()) {
            context.handler.handle_discovered_tests(chunk).await;
        }

        let next_proxy = if is_aborted || !self.pool.shared_hosts() {
            self.pool.replace_manager(proxy).await
        } else {
            Some(Arc::clone(proxy))
        };
        self.complete_unit(&context, total_tests, is_aborted, next_proxy)
            .await
    }

    async fn complete_unit(
        &self,
        context: &Arc<RequestContext>,
        total_tests: i64,
        is_aborted: bool,
        next_proxy: Option<DiscoveryProxy>,
    ) -> bool {
        let (next, finished) = {
            let mut state = self.state.lock().await;
            if !state.is_current(context.id) {
                return false;
            }
            state.aggregator_mut().aggregate(total_tests, is_aborted);
            let unit = state.complete_unit(next_proxy);

            let finished = unit.finished.then(|| {
                if state.abort_requested() || state.has_pending() {
                    state.aggregator_mut().mark_aborted();
                }
                state.finish();
                let aggregator = state.aggregator_mut();
                (aggregator.total_tests(), aggregator.is_aborted())
            });
            (unit.next, finished)
        };

        if let Some((proxy, item)) = next {
            self.dispatch(proxy, item, Arc::clone(context));
        }

        match finished {
            Some((total, aborted)) => {
                info!(
                    "Discovery request {} complete: {} tests (aborted: {})",
                    context.trace_id, total, aborted
                );
                context
                    .handler
                    .handle_discovery_complete(total, None, aborted)
                    .await;
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, proxy: DiscoveryProxy, item: WorkItem, context: Arc<RequestContext>) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let span = tracing::debug_span!(
            "discover",
            request = %context.trace_id,
            source = %item.source()
        );

        tokio::spawn(
            async move {
                let handler: Arc<dyn DiscoveryEventsHandler> =
                    Arc::new(ParallelDiscoveryEventsHandler {
                        manager: Arc::clone(&manager),
                        proxy: Arc::clone(&proxy),
                        request_id: context.id,
                        actual: Arc::clone(&context.handler),
                    });
                let criteria = context.criteria.for_source(item.source());

                let accepted = match proxy.initialize().await {
                    Ok(()) => proxy.discover_tests(criteria, handler).await,
                    Err(e) => Err(e),
                };
                match accepted {
                    Ok(()) => manager.forward_pending_abort(&proxy, context.id).await,
                    Err(e) => manager.handle_dispatch_failure(proxy, item, context, e).await,
                }
            }
            .instrument(span),
        );
    }

    /// An abort broadcast while the unit was being handed over found the
    /// proxy idle; pass it on now that the proxy owns the unit
    async fn forward_pending_abort(&self, proxy: &DiscoveryProxy, request_id: u64) {
        let pending = self.state.lock().await.pending_stop(request_id);
        if pending.is_some() {
            debug!("Forwarding abort to a proxy that just accepted its unit");
            proxy.abort().await;
        }
    }

    /// A proxy refused its unit; retry it on a fresh proxy or give up on it
    async fn handle_dispatch_failure(
        &self,
        proxy: DiscoveryProxy,
        item: WorkItem,
        context: Arc<RequestContext>,
        error: OrchestratorError,
    ) {
        warn!("Failed to dispatch discovery of {}: {}", item.source(), error);
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
                debug!("Retrying discovery of {} on a fresh proxy", next.source());
                self.dispatch(replacement, next, context);
            }
            None => {
                context
                    .handler
                    .handle_log_message(
                        MessageLevel::Error,
                        format!("Failed to discover tests in {}: {error}", item.source()),
                    )
                    .await;
                self.complete_unit(&context, -1, true, replacement).await;
            }
        }
    }
}

#[async_trait]
impl ProxyLifecycle for ParallelProxyDiscoveryManager {
    async fn initialize(&self) -> Result<()> {
        self.pool
            .do_action_on_all_managers(|proxy: DiscoveryProxy| async move { proxy.initialize().await }, true)
            .await
    }

    /// Abort in-flight discovery; queued sources stay undiscovered
    async fn abort(&self) {
        if !self.state.lock().await.request_stop(StopRequest::Abort) {
            return;
        }
        info!("Aborting parallel discovery");
        let _ = self
            .pool
            .do_action_on_all_managers(
                |proxy: DiscoveryProxy| async move {
                    proxy.abort().await;
                    Ok(())
                },
                true,
            )
            .await;
    }

    async fn close(&self) {
        if !self.state.lock().await.close() {
            return;
        }
        let _ = self
            .pool
            .do_action_on_all_managers(
                |proxy: DiscoveryProxy| async move {
                    proxy.close().await;
                    Ok(())
                },
                false,
            )
            .await;
    }
}

#[async_trait]
impl ProxyDiscoveryManager for ParallelProxyDiscoveryManager {
    async fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.is_closed() {
                return Err(OrchestratorError::InvalidState(
                    "Parallel discovery manager is closed".to_string(),
                ));
            }
            if state.is_in_progress() {
                return Err(OrchestratorError::InvalidState(
                    "Discovery is already in progress".to_string(),
                ));
            }
        }
        self.initialize().await?;

        if criteria.sources.is_empty() {
            handler.handle_discovery_complete(0, None, false).await;
            return Ok(());
        }

        let managers = self.pool.managers().await;
        let (context, batch) = {
            let mut state = self.state.lock().await;
            if state.is_in_progress() {
                return Err(OrchestratorError::InvalidState(
                    "Discovery is already in progress".to_string(),
                ));
            }
            let id = state.next_id();
            let context = Arc::new(RequestContext {
                id,
                trace_id: Uuid::new_v4(),
                criteria: criteria.clone(),
                handler,
            });
            let items = criteria.sources.iter().cloned().map(WorkItem::Source);
            let batch = state.begin(id, Arc::clone(&context), items, managers);
            (context, batch)
        };

        info!(
            "Discovery request {}: {} sources on {} proxies",
            context.trace_id,
            criteria.sources.len(),
            batch.len()
        );
        for (proxy, item) in batch {
            self.dispatch(proxy, item, Arc::clone(&context));
        }
        Ok(())
    }
}

/// Per-proxy handler that intercepts the partial completion
struct ParallelDiscoveryEventsHandler {
    manager: Arc<ParallelProxyDiscoveryManager>,
    proxy: DiscoveryProxy,
    request_id: u64,
    actual: Arc<dyn DiscoveryEventsHandler>,
}

#[async_trait]
impl DiscoveryEventsHandler for ParallelDiscoveryEventsHandler {
    async fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        self.actual.handle_discovered_tests(tests).await;
    }

    async fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    ) {
        self.manager
            .handle_partial_discovery_complete(
                &self.proxy,
                self.request_id,
                total_tests,
                last_chunk,
                is_aborted,
            )
            .await;
    }

    async fn handle_log_message(&self, level: MessageLevel, message: String) {
        self.actual.handle_log_message(level, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBehavior, MockProxyFactory, RecordingDiscoveryHandler};
    use std::collections::HashSet;

    fn manager(
        behavior: MockBehavior,
        level: usize,
        shared: bool,
    ) -> (Arc<ParallelProxyDiscoveryManager>, Arc<MockProxyFactory>) {
        let factory = MockProxyFactory::new(behavior);
        let f = Arc::clone(&factory);
        let manager = ParallelProxyDiscoveryManager::new(
            Arc::new(move || f.create() as DiscoveryProxy),
            level,
            shared,
            1,
        );
        (manager, factory)
    }

    fn sources(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i}.dll")).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_source_discovered_once() {
        let behavior = MockBehavior {
            max_delay_ms: 15,
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 3, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(12)), handler.clone())
            .await
            .unwrap();

        let (total, last_chunk, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, 24);
        assert!(last_chunk.is_none());
        assert!(!aborted);
        assert_eq!(handler.discovered().len(), 24);
        assert_eq!(handler.completions().len(), 1);

        let processed = factory.processed();
        assert_eq!(processed.len(), 12);
        let unique: HashSet<_> = processed.iter().collect();
        assert_eq!(unique.len(), 12);
        assert!(factory.max_concurrent() <= 3);
        // shared hosts: no replacement
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn test_empty_sources_complete_immediately() {
        let (manager, factory) = manager(MockBehavior::default(), 2, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(Vec::new()), handler.clone())
            .await
            .unwrap();

        assert_eq!(handler.completions(), vec![(0, false)]);
        assert!(factory.processed().is_empty());
        assert!(!manager.is_in_progress().await);
    }

    #[tokio::test]
    async fn test_fewer_sources_than_level() {
        let (manager, factory) = manager(MockBehavior::default(), 4, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(2)), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, 4);
        assert!(!aborted);
        assert_eq!(factory.processed().len(), 2);
    }

    #[tokio::test]
    async fn test_unshared_proxies_replaced_per_source() {
        let (manager, factory) = manager(MockBehavior::default(), 2, false);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(5)), handler.clone())
            .await
            .unwrap();
        handler.wait_for_completion().await;

        assert_eq!(factory.created(), 2 + 5);
        assert_eq!(factory.total_closes(), 5);
        assert_eq!(manager.pool().parallel_level().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_partial_aborts_result() {
        let behavior = MockBehavior {
            abort_sources: vec!["1.dll".into()],
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 2, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(4)), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, -1);
        assert!(aborted);
        // the rest of the sources still ran
        assert_eq!(factory.processed().len(), 4);
        // aborted proxy was replaced
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn test_abort_stops_dispatch() {
        let behavior = MockBehavior {
            hang: true,
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 2, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(6)), handler.clone())
            .await
            .unwrap();
        while factory.processed().len() < 2 {
            tokio::task::yield_now().await;
        }

        manager.abort().await;
        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, -1);
        assert!(aborted);
        assert_eq!(factory.processed().len(), 2);
        assert!(factory.total_aborts() >= 2);
        assert_eq!(handler.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_during_slow_initialize_reaches_proxy() {
        let behavior = MockBehavior {
            hang: true,
            initialize_delay_ms: 50,
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 1, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(1)), handler.clone())
            .await
            .unwrap();
        // the unit is still being initialized on its proxy
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(factory.processed().is_empty());

        manager.abort().await;
        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, -1);
        assert!(aborted);
        assert_eq!(factory.processed(), vec!["0.dll".to_string()]);
        assert_eq!(factory.total_aborts(), 2);
        assert!(!manager.is_in_progress().await);
    }

    #[tokio::test]
    async fn test_single_always_aborting_proxy_processes_all_sources() {
        let behavior = MockBehavior {
            always_abort: true,
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 1, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());
        let sources = vec!["1.dll".to_string(), "2.dll".to_string()];

        manager
            .discover_tests(DiscoveryCriteria::new(sources.clone()), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, -1);
        assert!(aborted);
        assert_eq!(factory.processed(), sources);
        // each aborted proxy is swapped for a fresh one
        assert_eq!(factory.created(), 3);
        assert_eq!(handler.completions(), vec![(-1, true)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_sources_on_two_proxies() {
        let (manager, factory) = manager(MockBehavior::default(), 2, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());
        let sources = vec!["1.dll".to_string(), "2.dll".to_string()];

        manager
            .discover_tests(DiscoveryCriteria::new(sources), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, 4);
        assert!(!aborted);
        let mut processed = factory.processed();
        processed.sort();
        assert_eq!(processed, vec!["1.dll".to_string(), "2.dll".to_string()]);
        assert_eq!(handler.completions().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_dispatch_retried_on_fresh_proxy() {
        let behavior = MockBehavior {
            reject_first: 1,
            ..Default::default()
        };
        let (manager, factory) = manager(behavior, 1, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(2)), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, 4);
        assert!(!aborted);
        assert_eq!(factory.created(), 2);
        assert_eq!(factory.processed(), vec!["0.dll".to_string(), "1.dll".to_string()]);
    }

    #[tokio::test]
    async fn test_refused_beyond_retry_limit_counts_as_aborted() {
        let behavior = MockBehavior {
            reject_first: 2,
            ..Default::default()
        };
        let (manager, _factory) = manager(behavior, 1, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(2)), handler.clone())
            .await
            .unwrap();

        let (total, _, aborted) = handler.wait_for_completion().await;
        assert_eq!(total, -1);
        assert!(aborted);
        assert_eq!(handler.logs()[0].0, MessageLevel::Error);
    }

    #[tokio::test]
    async fn test_rejects_overlapping_requests() {
        let behavior = MockBehavior {
            hang: true,
            ..Default::default()
        };
        let (manager, _factory) = manager(behavior, 1, true);
        let handler = Arc::new(RecordingDiscoveryHandler::default());

        manager
            .discover_tests(DiscoveryCriteria::new(sources(1)), handler.clone())
            .await
            .unwrap();
        assert!(manager
            .discover_tests(DiscoveryCriteria::new(sources(1)), handler.clone())
            .await
            .is_err());
        assert!(manager.update_parallel_level(3).await.is_err());

        manager.abort().await;
        handler.wait_for_completion().await;
        manager.update_parallel_level(3).await.unwrap();
        assert_eq!(manager.pool().parallel_level().await, 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (manager, factory) = manager(MockBehavior::default(), 3, true);
        manager.close().await;
        manager.close().await;
        assert_eq!(factory.total_closes(), 3);

        let handler = Arc::new(RecordingDiscoveryHandler::default());
        assert!(manager
            .discover_tests(DiscoveryCriteria::new(sources(1)), handler)
            .await
            .is_err());
    }
}
