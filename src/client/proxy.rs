//! Proxy lifecycle shared by discovery and execution proxies
//!
//! A proxy owns one test host for one unit of work at a time. It moves
//! `Created -> Initialized -> Busy -> (Completed | Aborted) -> Closed`, and
//! may return from `Completed` to `Busy` only when its runtime provider
//! allows the host to be shared.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::host::{TestHostLauncher, TestRuntimeProvider, WorkerEvent, WorkerHandle};
use crate::protocol::{Message, MessageType};
use crate::transport::{reserve_local_endpoint, Transport};

/// Lifecycle operations every proxy supports
#[async_trait]
pub trait ProxyLifecycle: Send + Sync {
    /// Idempotent setup
    async fn initialize(&self) -> Result<()>;

    /// Stop in-flight work; a no-op when idle
    async fn abort(&self);

    /// Release the test host; idempotent
    async fn close(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Created,
    Initialized,
    Busy,
    Completed,
    Aborted,
    Closed,
}

pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// A connected worker and its event stream
pub struct WorkerChannel {
    pub worker: WorkerHandle,
    pub events: UnboundedReceiver<WorkerEvent>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel").finish_non_exhaustive()
    }
}

struct OperationInner {
    id: String,
    runtime: Arc<dyn TestRuntimeProvider>,
    launcher: Arc<dyn TestHostLauncher>,
    transport_factory: TransportFactory,
    state: Mutex<ProxyState>,
    worker: Mutex<Option<WorkerHandle>>,
    idle_channel: Mutex<Option<WorkerChannel>>,
    abort_requested: AtomicBool,
    hosts_launched: AtomicUsize,
}

/// Test host bookkeeping shared by the discovery and execution proxies
#[derive(Clone)]
pub struct ProxyOperationManager {
    inner: Arc<OperationInner>,
}

impl ProxyOperationManager {
    pub fn new(
        id: impl Into<String>,
        runtime: Arc<dyn TestRuntimeProvider>,
        launcher: Arc<dyn TestHostLauncher>,
        transport_factory: TransportFactory,
    ) -> Self {
        Self {
            inner: Arc::new(OperationInner {
                id: id.into(),
                runtime,
                launcher,
                transport_factory,
                state: Mutex::new(ProxyState::Created),
                worker: Mutex::new(None),
                idle_channel: Mutex::new(None),
                abort_requested: AtomicBool::new(false),
                hosts_launched: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_shared(&self) -> bool {
        self.inner.runtime.shared()
    }

    pub async fn state(&self) -> ProxyState {
        *self.inner.state.lock().await
    }

    pub fn abort_requested(&self) -> bool {
        self.inner.abort_requested.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match *state {
            ProxyState::Created => {
                *state = ProxyState::Initialized;
                debug!("Proxy {} initialized", self.inner.id);
                Ok(())
            }
            ProxyState::Closed => Err(OrchestratorError::InvalidState(format!(
                "Proxy {} is closed",
                self.inner.id
            ))),
            _ => Ok(()),
        }
    }

    /// Claim the proxy for one unit of work
    pub async fn begin_operation(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let accepted = match *state {
            ProxyState::Created | ProxyState::Initialized => true,
            ProxyState::Completed => self.is_shared(),
            _ => false,
        };
        if !accepted {
            return Err(OrchestratorError::InvalidState(format!(
                "Proxy {} cannot accept work while {:?}",
                self.inner.id, *state
            )));
        }
        *state = ProxyState::Busy;
        self.inner.abort_requested.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Launch (or reuse) a test host for `sources` and connect to it
    pub async fn setup_channel(&self, sources: &[String]) -> Result<WorkerChannel> {
        if self.is_shared() {
            if let Some(channel) = self.inner.idle_channel.lock().await.take() {
                if channel.worker.is_connected().await {
                    debug!("Proxy {} reusing test host {}", self.inner.id, channel.worker.id());
                    return Ok(channel);
                }
                channel.worker.stop().await;
            }
        }

        let endpoint = reserve_local_endpoint()?;
        let start_info = self.inner.runtime.start_info(sources, &endpoint)?;
        let host_number = self.inner.hosts_launched.fetch_add(1, Ordering::SeqCst);
        let (worker, mut events) = WorkerHandle::new(
            format!("{}-host-{}", self.inner.id, host_number),
            (self.inner.transport_factory)(),
            Some(Arc::clone(&self.inner.launcher)),
        );
        *self.inner.worker.lock().await = Some(worker.clone());
        // an abort that landed before the worker was stored found nothing to stop
        self.ensure_not_aborted()?;

        let process_id = worker.launch(&start_info).await?;
        info!(
            "Proxy {} launched test host (pid {}) for {}",
            self.inner.id,
            process_id,
            sources.join(", ")
        );
        worker.start(&endpoint).await?;
        if let Err(e) = self.ensure_not_aborted() {
            worker.stop().await;
            return Err(e);
        }

        // start() succeeded, so Connected is already queued
        if let Some(WorkerEvent::Connected { endpoint, .. }) = events.recv().await {
            debug!("Proxy {} connected to {}", self.inner.id, endpoint);
        }

        Ok(WorkerChannel { worker, events })
    }

    fn ensure_not_aborted(&self) -> Result<()> {
        if self.abort_requested() {
            return Err(OrchestratorError::InvalidState(format!(
                "Proxy {} was aborted while starting its test host",
                self.inner.id
            )));
        }
        Ok(())
    }

    /// Send to the current test host
    pub async fn send(&self, message: &Message) -> Result<()> {
        let worker = self.inner.worker.lock().await.clone();
        match worker {
            Some(worker) => worker.send(message).await,
            None => Err(OrchestratorError::InvalidState(format!(
                "Proxy {} has no test host",
                self.inner.id
            ))),
        }
    }

    /// Record the end of a unit of work; runs before the caller is notified
    pub async fn complete_operation(&self, aborted: bool, channel: WorkerChannel) {
        let mut state = self.inner.state.lock().await;
        if *state == ProxyState::Closed {
            drop(state);
            channel.worker.stop().await;
            return;
        }

        if aborted {
            *state = ProxyState::Aborted;
            drop(state);
            channel.worker.stop().await;
        } else if self.is_shared() {
            *state = ProxyState::Completed;
            *self.inner.idle_channel.lock().await = Some(channel);
        } else {
            *state = ProxyState::Completed;
            drop(state);
            channel.worker.stop().await;
        }
    }

    /// Record a unit of work that failed before it got going
    pub async fn fail_operation(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if *state != ProxyState::Closed {
                *state = ProxyState::Aborted;
            }
        }
        if let Some(worker) = self.inner.worker.lock().await.take() {
            worker.stop().await;
        }
    }

    /// Mark an abort; returns the busy worker if there is work to stop
    pub async fn request_abort(&self) -> Option<WorkerHandle> {
        if *self.inner.state.lock().await != ProxyState::Busy {
            return None;
        }
        self.inner.abort_requested.store(true, Ordering::SeqCst);
        self.inner.worker.lock().await.clone()
    }

    pub async fn is_busy(&self) -> bool {
        *self.inner.state.lock().await == ProxyState::Busy
    }

    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if *state == ProxyState::Closed {
                return;
            }
            *state = ProxyState::Closed;
        }
        debug!("Closing proxy {}", self.inner.id);

        let idle = self.inner.idle_channel.lock().await.take();
        let worker = self.inner.worker.lock().await.take();
        for worker in idle.map(|c| c.worker).into_iter().chain(worker) {
            if worker.is_connected().await {
                if let Err(e) = worker.send(&Message::new(MessageType::SessionEnd)).await {
                    warn!("Proxy {} failed to send session end: {}", self.inner.id, e);
                }
            }
            worker.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{host_pair_factory, FakeLauncher, FakeRuntime};

    fn manager(shared: bool) -> (ProxyOperationManager, crate::testing::HostEnds) {
        let (factory, hosts) = host_pair_factory();
        let manager = ProxyOperationManager::new(
            "proxy-1",
            Arc::new(FakeRuntime::new(shared)),
            Arc::new(FakeLauncher::default()),
            factory,
        );
        (manager, hosts)
    }

    #[tokio::test]
    async fn test_abort_before_host_start_fails_setup() {
        let (proxy, hosts) = manager(false);
        proxy.initialize().await.unwrap();
        proxy.begin_operation().await.unwrap();

        // busy but no worker yet: the abort can only be recorded
        assert!(proxy.request_abort().await.is_none());
        assert!(proxy.abort_requested());

        let error = proxy.setup_channel(&["1.dll".to_string()]).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::InvalidState(_)));
        assert_eq!(hosts.created(), 1);
        proxy.fail_operation().await;
        assert_eq!(proxy.state().await, ProxyState::Aborted);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (proxy, _hosts) = manager(false);
        assert_eq!(proxy.state().await, ProxyState::Created);

        proxy.initialize().await.unwrap();
        proxy.initialize().await.unwrap();
        assert_eq!(proxy.state().await, ProxyState::Initialized);

        proxy.begin_operation().await.unwrap();
        assert!(proxy.begin_operation().await.is_err());

        let channel = proxy.setup_channel(&["1.dll".to_string()]).await.unwrap();
        proxy.complete_operation(false, channel).await;
        assert_eq!(proxy.state().await, ProxyState::Completed);

        // not shared: one unit of work only
        assert!(proxy.begin_operation().await.is_err());

        proxy.close().await;
        proxy.close().await;
        assert_eq!(proxy.state().await, ProxyState::Closed);
        assert!(proxy.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_shared_proxy_reuses_host() {
        let (proxy, hosts) = manager(true);
        proxy.initialize().await.unwrap();

        proxy.begin_operation().await.unwrap();
        let channel = proxy.setup_channel(&["1.dll".to_string()]).await.unwrap();
        let first_host = channel.worker.id().to_string();
        proxy.complete_operation(false, channel).await;

        proxy.begin_operation().await.unwrap();
        let channel = proxy.setup_channel(&["2.dll".to_string()]).await.unwrap();
        assert_eq!(channel.worker.id(), first_host);
        assert_eq!(hosts.created(), 1);
        proxy.complete_operation(true, channel).await;

        assert_eq!(proxy.state().await, ProxyState::Aborted);
        assert!(proxy.begin_operation().await.is_err());
    }

    #[tokio::test]
    async fn test_abort_when_idle_is_noop() {
        let (proxy, _hosts) = manager(false);
        assert!(proxy.request_abort().await.is_none());
        assert!(!proxy.abort_requested());
    }

    #[tokio::test]
    async fn test_close_sends_session_end() {
        let (proxy, hosts) = manager(true);
        proxy.begin_operation().await.unwrap();
        let channel = proxy.setup_channel(&["1.dll".to_string()]).await.unwrap();
        proxy.complete_operation(false, channel).await;

        proxy.close().await;
        let host = hosts.next().await;
        assert_eq!(
            host.receive().await.unwrap().message_type,
            MessageType::SessionEnd
        );
    }
}
