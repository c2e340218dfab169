//! Test doubles shared by the unit tests

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{oneshot, Notify};

use crate::client::{ProxyDiscoveryManager, ProxyExecutionManager, ProxyLifecycle, TransportFactory};
use crate::datacollection::DataCollectionManager;
use crate::error::{OrchestratorError, Result};
use crate::events::{DiscoveryEventsHandler, MessageLevel, RunEventsHandler};
use crate::host::{LaunchedProcess, TestHostLauncher, TestProcessStartInfo, TestRuntimeProvider};
use crate::models::{
    AttachmentSet, DiscoveryCriteria, Metrics, TestCase, TestOutcome, TestRunChangedArgs,
    TestRunCompleteArgs, TestRunCriteria, TestRunStatistics, TestRunTarget,
};
use crate::protocol::TestCaseEventPayload;
use crate::transport::memory::MemoryTransport;
use crate::transport::Transport;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host ends of the memory transports handed out by [`host_pair_factory`]
pub struct HostEnds {
    rx: tokio::sync::Mutex<UnboundedReceiver<MemoryTransport>>,
    created: Arc<AtomicUsize>,
}

impl HostEnds {
    pub async fn next(&self) -> MemoryTransport {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
            .await
            .expect("no test host was connected")
            .expect("transport factory dropped")
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

/// Transport factory whose every transport is paired with a host end
pub fn host_pair_factory() -> (TransportFactory, HostEnds) {
    let (tx, rx) = unbounded_channel();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let factory: TransportFactory = Arc::new(move || {
        let (controller, host) = MemoryTransport::pair();
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(host);
        Arc::new(controller) as Arc<dyn Transport>
    });
    (
        factory,
        HostEnds {
            rx: tokio::sync::Mutex::new(rx),
            created,
        },
    )
}

pub struct FakeRuntime {
    shared: bool,
}

impl FakeRuntime {
    pub fn new(shared: bool) -> Self {
        Self { shared }
    }
}

impl TestRuntimeProvider for FakeRuntime {
    fn shared(&self) -> bool {
        self.shared
    }

    fn start_info(&self, _sources: &[String], endpoint: &str) -> Result<TestProcessStartInfo> {
        Ok(TestProcessStartInfo::new("fake-host")
            .with_argument("--endpoint")
            .with_argument(endpoint))
    }
}

pub struct FailingRuntime;

impl TestRuntimeProvider for FailingRuntime {
    fn shared(&self) -> bool {
        false
    }

    fn start_info(&self, _sources: &[String], _endpoint: &str) -> Result<TestProcessStartInfo> {
        Err(OrchestratorError::Configuration(
            "no test host for this source".to_string(),
        ))
    }
}

/// Pretends to launch a process; the fake never exits on its own
#[derive(Default)]
pub struct FakeLauncher {
    launched: AtomicUsize,
}

#[async_trait]
impl TestHostLauncher for FakeLauncher {
    async fn launch(&self, _start_info: &TestProcessStartInfo) -> Result<LaunchedProcess> {
        let n = self.launched.fetch_add(1, Ordering::SeqCst) as u32;
        let (_exit_tx, exited) = oneshot::channel();
        let (kill, _kill_rx) = oneshot::channel();
        Ok(LaunchedProcess {
            process_id: 1000 + n,
            exited,
            kill,
        })
    }
}

#[derive(Default)]
struct DiscoveryRecord {
    discovered: Vec<TestCase>,
    logs: Vec<(MessageLevel, String)>,
    completions: Vec<(i64, Option<Vec<TestCase>>, bool)>,
}

#[derive(Default)]
pub struct RecordingDiscoveryHandler {
    record: Mutex<DiscoveryRecord>,
    completed: Notify,
}

impl RecordingDiscoveryHandler {
    pub async fn wait_for_completion(&self) -> (i64, Option<Vec<TestCase>>, bool) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.completed.notified();
                if let Some(c) = self.record.lock().unwrap().completions.first().cloned() {
                    return c;
                }
                notified.await;
            }
        })
        .await
        .expect("discovery did not complete")
    }

    pub fn discovered(&self) -> Vec<TestCase> {
        self.record.lock().unwrap().discovered.clone()
    }

    pub fn logs(&self) -> Vec<(MessageLevel, String)> {
        self.record.lock().unwrap().logs.clone()
    }

    pub fn completions(&self) -> Vec<(i64, bool)> {
        self.record
            .lock()
            .unwrap()
            .completions
            .iter()
            .map(|(total, _, aborted)| (*total, *aborted))
            .collect()
    }
}

#[async_trait]
impl DiscoveryEventsHandler for RecordingDiscoveryHandler {
    async fn handle_discovered_tests(&self, tests: Vec<TestCase>) {
        self.record.lock().unwrap().discovered.extend(tests);
    }

    async fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    ) {
        self.record
            .lock()
            .unwrap()
            .completions
            .push((total_tests, last_chunk, is_aborted));
        self.completed.notify_waiters();
    }

    async fn handle_log_message(&self, level: MessageLevel, message: String) {
        self.record.lock().unwrap().logs.push((level, message));
    }
}

#[derive(Default)]
struct RunRecord {
    stats_changes: Vec<TestRunChangedArgs>,
    logs: Vec<(MessageLevel, String)>,
    completions: Vec<TestRunCompleteArgs>,
    attachments: Vec<AttachmentSet>,
    metrics: Vec<Metrics>,
}

#[derive(Default)]
pub struct RecordingRunHandler {
    record: Mutex<RunRecord>,
    completed: Notify,
}

impl RecordingRunHandler {
    pub async fn wait_for_completion(&self) -> TestRunCompleteArgs {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let notified = self.completed.notified();
                if let Some(c) = self.record.lock().unwrap().completions.first().cloned() {
                    return c;
                }
                notified.await;
            }
        })
        .await
        .expect("test run did not complete")
    }

    pub fn stats_changes(&self) -> usize {
        self.record.lock().unwrap().stats_changes.len()
    }

    pub fn completions(&self) -> usize {
        self.record.lock().unwrap().completions.len()
    }

    pub fn attachments(&self) -> Vec<AttachmentSet> {
        self.record.lock().unwrap().attachments.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.record
            .lock()
            .unwrap()
            .metrics
            .first()
            .cloned()
            .unwrap_or_default()
    }

    pub fn logs(&self) -> Vec<(MessageLevel, String)> {
        self.record.lock().unwrap().logs.clone()
    }
}

#[async_trait]
impl RunEventsHandler for RecordingRunHandler {
    async fn handle_test_run_stats_change(&self, args: TestRunChangedArgs) {
        self.record.lock().unwrap().stats_changes.push(args);
    }

    async fn handle_test_run_complete(
        &self,
        complete: TestRunCompleteArgs,
        last_chunk: Option<TestRunChangedArgs>,
        attachments: Vec<AttachmentSet>,
        metrics: Metrics,
    ) {
        {
            let mut record = self.record.lock().unwrap();
            record.stats_changes.extend(last_chunk);
            record.completions.push(complete);
            record.attachments.extend(attachments);
            record.metrics.push(metrics);
        }
        self.completed.notify_waiters();
    }

    async fn handle_log_message(&self, level: MessageLevel, message: String) {
        self.record.lock().unwrap().logs.push((level, message));
    }
}

/// How every proxy built by a [`MockProxyFactory`] behaves
#[derive(Clone, Debug)]
pub struct MockBehavior {
    pub tests_per_source: usize,
    pub max_delay_ms: u64,
    pub always_abort: bool,
    /// Sources whose unit of work ends aborted
    pub abort_sources: Vec<String>,
    /// Number of dispatches refused before proxies accept work
    pub reject_first: usize,
    /// Proxies hold their work until aborted or canceled
    pub hang: bool,
    pub initialize_delay_ms: u64,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            tests_per_source: 2,
            max_delay_ms: 0,
            always_abort: false,
            abort_sources: Vec::new(),
            reject_first: 0,
            hang: false,
            initialize_delay_ms: 0,
        }
    }
}

/// State shared by every proxy one factory created
#[derive(Default)]
struct MockShared {
    processed: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    rejected: AtomicUsize,
}

/// Proxy double for both discovery and execution pools
pub struct MockProxy {
    id: usize,
    behavior: MockBehavior,
    shared: Arc<MockShared>,
    initializes: AtomicUsize,
    aborts: AtomicUsize,
    cancels: AtomicUsize,
    closes: AtomicUsize,
    stop: Arc<Notify>,
    canceled: Arc<AtomicBool>,
    /// Set while a unit is running; idle proxies ignore abort and cancel
    busy: Arc<AtomicBool>,
}

impl MockProxy {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn initializes(&self) -> usize {
        self.initializes.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn accept(&self, sources: &[String]) -> Result<()> {
        if self.shared.rejected.fetch_add(1, Ordering::SeqCst) < self.behavior.reject_first {
            return Err(OrchestratorError::InvalidState(format!(
                "mock proxy {} refused work",
                self.id
            )));
        }
        self.busy.store(true, Ordering::SeqCst);
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active.fetch_max(active, Ordering::SeqCst);
        self.shared
            .processed
            .lock()
            .unwrap()
            .extend(sources.iter().cloned());
        Ok(())
    }

    fn aborts_unit(&self, sources: &[String]) -> bool {
        self.behavior.always_abort
            || sources
                .iter()
                .any(|s| self.behavior.abort_sources.contains(s))
    }

    /// Simulated work; returns true when stopped early
    fn work(&self) -> impl std::future::Future<Output = bool> + Send + 'static {
        let delay = match self.behavior.max_delay_ms {
            0 => Duration::ZERO,
            max => Duration::from_millis(rand::rng().random_range(0..=max)),
        };
        let hang = self.behavior.hang;
        let stop = Arc::clone(&self.stop);
        let busy = Arc::clone(&self.busy);
        async move {
            let wait = async {
                tokio::time::sleep(delay).await;
                if hang {
                    std::future::pending::<()>().await;
                }
            };
            let stopped = tokio::select! {
                _ = wait => false,
                _ = stop.notified() => true,
            };
            busy.store(false, Ordering::SeqCst);
            stopped
        }
    }
}

#[async_trait]
impl ProxyLifecycle for MockProxy {
    async fn initialize(&self) -> Result<()> {
        self.initializes.fetch_add(1, Ordering::SeqCst);
        if self.behavior.initialize_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.behavior.initialize_delay_ms)).await;
        }
        Ok(())
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyDiscoveryManager for MockProxy {
    async fn discover_tests(
        &self,
        criteria: DiscoveryCriteria,
        handler: Arc<dyn DiscoveryEventsHandler>,
    ) -> Result<()> {
        self.accept(&criteria.sources)?;
        let aborted = self.aborts_unit(&criteria.sources);
        let tests: Vec<TestCase> = criteria
            .sources
            .iter()
            .flat_map(|source| {
                (0..self.behavior.tests_per_source)
                    .map(move |i| TestCase::new(format!("Mock.Test{i}"), "executor://mock", source))
            })
            .collect();
        let work = self.work();
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            let stopped = work.await;
            shared.active.fetch_sub(1, Ordering::SeqCst);
            if aborted || stopped {
                handler.handle_discovery_complete(-1, None, true).await;
                return;
            }
            let total = tests.len() as i64;
            let mut tests = tests;
            let last = tests.split_off(tests.len() / 2);
            if !tests.is_empty() {
                handler.handle_discovered_tests(tests).await;
            }
            handler
                .handle_discovery_complete(total, Some(last), false)
                .await;
        });
        Ok(())
    }
}

#[async_trait]
impl ProxyExecutionManager for MockProxy {
    async fn start_test_run(
        &self,
        criteria: TestRunCriteria,
        handler: Arc<dyn RunEventsHandler>,
    ) -> Result<()> {
        let sources = criteria.sources();
        self.accept(&sources)?;
        let aborted = self.aborts_unit(&sources);
        let executed = match &criteria.target {
            TestRunTarget::Sources(sources) => sources.len() * self.behavior.tests_per_source,
            TestRunTarget::Tests(tests) => tests.len(),
        };
        self.canceled.store(false, Ordering::SeqCst);
        let work = self.work();
        let shared = Arc::clone(&self.shared);
        let canceled = Arc::clone(&self.canceled);

        tokio::spawn(async move {
            let stopped = work.await;
            shared.active.fetch_sub(1, Ordering::SeqCst);
            let mut stats = TestRunStatistics::new();
            if aborted || stopped {
                let mut complete = TestRunCompleteArgs::aborted(None, Duration::from_millis(5));
                complete.is_canceled = canceled.load(Ordering::SeqCst);
                complete.is_aborted = !complete.is_canceled;
                handler
                    .handle_test_run_complete(complete, None, Vec::new(), Metrics::new())
                    .await;
                return;
            }
            for _ in 0..executed {
                stats.record(TestOutcome::Passed);
            }
            handler
                .handle_test_run_stats_change(TestRunChangedArgs::new(stats.clone(), Vec::new()))
                .await;
            let attachments = sources
                .iter()
                .map(|s| AttachmentSet::new("datacollector://mock", s.clone()))
                .collect();
            let mut metrics = Metrics::new();
            metrics.insert("TotalTests".to_string(), serde_json::json!(executed));
            handler
                .handle_test_run_complete(
                    TestRunCompleteArgs::completed(stats.clone(), Duration::from_millis(5)),
                    Some(TestRunChangedArgs::new(stats, Vec::new())),
                    attachments,
                    metrics,
                )
                .await;
        });
        Ok(())
    }

    async fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            self.canceled.store(true, Ordering::SeqCst);
            self.stop.notify_one();
        }
    }
}

/// Builds [`MockProxy`] instances and remembers all of them
pub struct MockProxyFactory {
    behavior: MockBehavior,
    shared: Arc<MockShared>,
    proxies: Mutex<Vec<Arc<MockProxy>>>,
}

impl MockProxyFactory {
    pub fn new(behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            shared: Arc::new(MockShared::default()),
            proxies: Mutex::new(Vec::new()),
        })
    }

    pub fn create(&self) -> Arc<MockProxy> {
        let mut proxies = self.proxies.lock().unwrap();
        let proxy = Arc::new(MockProxy {
            id: proxies.len(),
            behavior: self.behavior.clone(),
            shared: Arc::clone(&self.shared),
            initializes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            stop: Arc::new(Notify::new()),
            canceled: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicBool::new(false)),
        });
        proxies.push(Arc::clone(&proxy));
        proxy
    }

    pub fn created(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    pub fn proxies(&self) -> Vec<Arc<MockProxy>> {
        self.proxies.lock().unwrap().clone()
    }

    pub fn total_closes(&self) -> usize {
        self.proxies().iter().map(|p| p.closes()).sum()
    }

    pub fn total_aborts(&self) -> usize {
        self.proxies().iter().map(|p| p.aborts()).sum()
    }

    pub fn total_cancels(&self) -> usize {
        self.proxies().iter().map(|p| p.cancels()).sum()
    }

    /// Sources handed to any proxy, in dispatch order
    pub fn processed(&self) -> Vec<String> {
        self.shared.processed.lock().unwrap().clone()
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_active.load(Ordering::SeqCst)
    }
}

/// Records every call a data collection session makes
pub struct RecordingDataCollectionManager {
    events_required: bool,
    settings: Mutex<Vec<String>>,
    sessions_started: AtomicUsize,
    test_cases_started: AtomicUsize,
    test_cases_ended: AtomicUsize,
    launched_hosts: Mutex<Vec<u32>>,
    sessions_ended: Mutex<Vec<bool>>,
    disposes: AtomicUsize,
}

impl RecordingDataCollectionManager {
    pub fn new(events_required: bool) -> Self {
        Self {
            events_required,
            settings: Mutex::new(Vec::new()),
            sessions_started: AtomicUsize::new(0),
            test_cases_started: AtomicUsize::new(0),
            test_cases_ended: AtomicUsize::new(0),
            launched_hosts: Mutex::new(Vec::new()),
            sessions_ended: Mutex::new(Vec::new()),
            disposes: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> Vec<String> {
        self.settings.lock().unwrap().clone()
    }

    pub fn sessions_started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }

    pub fn test_cases_started(&self) -> usize {
        self.test_cases_started.load(Ordering::SeqCst)
    }

    pub fn test_cases_ended(&self) -> usize {
        self.test_cases_ended.load(Ordering::SeqCst)
    }

    pub fn launched_hosts(&self) -> Vec<u32> {
        self.launched_hosts.lock().unwrap().clone()
    }

    pub fn sessions_ended(&self) -> Vec<bool> {
        self.sessions_ended.lock().unwrap().clone()
    }

    pub fn disposes(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataCollectionManager for RecordingDataCollectionManager {
    async fn load_data_collectors(&self, settings: &str) -> HashMap<String, String> {
        self.settings.lock().unwrap().push(settings.to_string());
        HashMap::from([("COLLECTOR_ENABLED".to_string(), "1".to_string())])
    }

    async fn session_started(&self) -> bool {
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        self.events_required
    }

    async fn test_case_started(&self, _event: &TestCaseEventPayload) {
        self.test_cases_started.fetch_add(1, Ordering::SeqCst);
    }

    async fn test_case_ended(&self, event: &TestCaseEventPayload) -> Vec<AttachmentSet> {
        self.test_cases_ended.fetch_add(1, Ordering::SeqCst);
        vec![AttachmentSet::new("datacollector://recording", event.test_case_name.clone())]
    }

    async fn session_ended(&self, is_cancelled: bool) -> Vec<AttachmentSet> {
        self.sessions_ended.lock().unwrap().push(is_cancelled);
        vec![AttachmentSet::new("datacollector://recording", "session")]
    }

    async fn test_host_launched(&self, process_id: u32) {
        self.launched_hosts.lock().unwrap().push(process_id);
    }

    async fn dispose(&self) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
    }
}
