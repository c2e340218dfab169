//! Test engine
//!
//! Turns an [`OrchestratorConfig`] into ready-to-use parallel discovery
//! and execution managers. Each pooled proxy owns its own test host and
//! TCP transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{
    ExecutionEngine, InProcessProxyExecutionManager, ProxyDiscoveryManager, ProxyExecutionManager,
    ProxyOperationManager, TestHostProxyDiscoveryManager, TestHostProxyExecutionManager,
    TransportFactory,
};
use crate::config::{ConfigFile, OrchestratorConfig};
use crate::datacollection::{
    DataCollectionManager, DataCollectionRequestHandler, TestCaseEventsHandler,
};
use crate::host::{
    DefaultTestRuntimeProvider, ProcessLauncher, RuntimeProviderRegistry, TestHostLauncher,
    TestRuntimeProvider,
};
use crate::models::TestRunCriteria;
use crate::parallel::{ParallelProxyDiscoveryManager, ParallelProxyExecutionManager, ProxyFactory};
use crate::transport::{TcpTransport, Transport};

pub struct TestEngine {
    config: OrchestratorConfig,
    runtimes: RuntimeProviderRegistry,
    launcher: Arc<dyn TestHostLauncher>,
    transport_factory: TransportFactory,
    in_process_engine: Option<Arc<dyn ExecutionEngine>>,
    proxies_created: Arc<AtomicUsize>,
}

impl TestEngine {
    pub fn new(config: OrchestratorConfig) -> Self {
        let fallback: Arc<dyn TestRuntimeProvider> =
            Arc::new(DefaultTestRuntimeProvider::new(config.testhost.clone()));
        let connect_timeout = config.worker_connect_timeout();
        let retry_interval = config.connect_retry_interval();
        let transport_factory: TransportFactory = Arc::new(move || {
            Arc::new(TcpTransport::new(connect_timeout, retry_interval)) as Arc<dyn Transport>
        });

        Self {
            config,
            runtimes: RuntimeProviderRegistry::new(fallback),
            launcher: Arc::new(ProcessLauncher::new()),
            transport_factory,
            in_process_engine: None,
            proxies_created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Engine for a config file, with one runtime provider per `runtimes` entry
    pub fn from_config_file(file: ConfigFile) -> Self {
        let mut engine = Self::new(file.orchestrator);
        for runtime in file.runtimes {
            debug!("Registering test host for .{}", runtime.extension.trim_start_matches('.'));
            engine.runtimes = engine.runtimes.register(
                &runtime.extension,
                Arc::new(DefaultTestRuntimeProvider::new(runtime.testhost)),
            );
        }
        engine
    }

    pub fn with_runtime(mut self, extension: &str, provider: Arc<dyn TestRuntimeProvider>) -> Self {
        self.runtimes = self.runtimes.register(extension, provider);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn TestHostLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Engine used when the config asks for in-process execution
    pub fn with_in_process_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.in_process_engine = Some(engine);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runtimes(&self) -> &RuntimeProviderRegistry {
        &self.runtimes
    }

    /// Configured parallelism, never more than the number of sources and never zero
    pub fn parallel_level(&self, source_count: usize) -> usize {
        self.config.parallel_level.min(source_count).max(1)
    }

    fn shared_hosts(&self, runtime: &dyn TestRuntimeProvider) -> bool {
        runtime.shared() && self.config.shared_hosts
    }

    fn next_proxy_id(counter: &AtomicUsize, kind: &str) -> String {
        format!("{kind}-{}", counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn discovery_manager(&self, sources: &[String]) -> Arc<ParallelProxyDiscoveryManager> {
        let runtime = self.runtimes.resolve_for_sources(sources);
        let level = self.parallel_level(sources.len());
        let shared = self.shared_hosts(runtime.as_ref());

        let launcher = Arc::clone(&self.launcher);
        let transport_factory = Arc::clone(&self.transport_factory);
        let counter = Arc::clone(&self.proxies_created);
        let proxy_runtime = Arc::clone(&runtime);
        let factory: ProxyFactory<dyn ProxyDiscoveryManager> = Arc::new(move || {
            let operation = ProxyOperationManager::new(
                Self::next_proxy_id(&counter, "discovery"),
                Arc::clone(&proxy_runtime),
                Arc::clone(&launcher),
                Arc::clone(&transport_factory),
            );
            Arc::new(TestHostProxyDiscoveryManager::new(operation)) as Arc<dyn ProxyDiscoveryManager>
        });

        info!(
            "Discovery manager for {} source(s): parallel level {}, shared hosts {}",
            sources.len(),
            level,
            shared
        );
        ParallelProxyDiscoveryManager::new(factory, level, shared, self.config.dispatch_retry_limit)
    }

    /// Worker-side data collection session over `transport`
    pub fn data_collection_request_handler(
        &self,
        transport: Arc<dyn Transport>,
        manager: Arc<dyn DataCollectionManager>,
        test_case_events: Arc<dyn TestCaseEventsHandler>,
    ) -> DataCollectionRequestHandler {
        DataCollectionRequestHandler::from_config(transport, manager, test_case_events, &self.config)
    }

    pub fn execution_manager(&self, criteria: &TestRunCriteria) -> Arc<ParallelProxyExecutionManager> {
        let sources = criteria.sources();

        if self.config.in_process {
            if let Some(engine) = &self.in_process_engine {
                info!("Running {} source(s) in process", sources.len());
                let engine = Arc::clone(engine);
                let factory: ProxyFactory<dyn ProxyExecutionManager> = Arc::new(move || {
                    Arc::new(InProcessProxyExecutionManager::new(Arc::clone(&engine)))
                        as Arc<dyn ProxyExecutionManager>
                });
                return ParallelProxyExecutionManager::new(
                    factory,
                    1,
                    false,
                    self.config.dispatch_retry_limit,
                );
            }
            debug!("In-process execution requested but no engine is available");
        }

        let runtime = self.runtimes.resolve_for_sources(&sources);
        let level = self.parallel_level(sources.len());
        let shared = self.shared_hosts(runtime.as_ref());

        let launcher = Arc::clone(&self.launcher);
        let transport_factory = Arc::clone(&self.transport_factory);
        let counter = Arc::clone(&self.proxies_created);
        let proxy_runtime = Arc::clone(&runtime);
        let factory: ProxyFactory<dyn ProxyExecutionManager> = Arc::new(move || {
            let operation = ProxyOperationManager::new(
                Self::next_proxy_id(&counter, "execution"),
                Arc::clone(&proxy_runtime),
                Arc::clone(&launcher),
                Arc::clone(&transport_factory),
            );
            Arc::new(TestHostProxyExecutionManager::new(operation)) as Arc<dyn ProxyExecutionManager>
        });

        info!(
            "Execution manager for {} source(s): parallel level {}, shared hosts {}",
            sources.len(),
            level,
            shared
        );
        ParallelProxyExecutionManager::new(factory, level, shared, self.config.dispatch_retry_limit)
    }
}
