//! Worker process handle
//!
//! A [`WorkerHandle`] owns one test host: the launched process, the
//! transport connected to it and the message loop reading from it.
//! Lifecycle changes are reported as [`WorkerEvent`]s on a channel owned by
//! whoever created the handle; dropping the receiver unsubscribes.
//!
//! Per handle at most one `Connected` is emitted, always before the single
//! `Disconnected`. `Disconnected` fires exactly once whatever the cause:
//! graceful stop, failure to connect, or the remote process going away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use super::{TestHostLauncher, TestProcessStartInfo};
use crate::error::{OrchestratorError, Result};
use crate::protocol::Message;
use crate::transport::Transport;
use crate::utils::Timer;

pub enum WorkerEvent {
    Connected {
        endpoint: String,
        channel: Arc<dyn Transport>,
    },
    Message(Message),
    Disconnected {
        error: Option<OrchestratorError>,
    },
}

impl fmt::Debug for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::Connected { endpoint, .. } => {
                f.debug_struct("Connected").field("endpoint", endpoint).finish()
            }
            WorkerEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
            WorkerEvent::Disconnected { error } => {
                f.debug_struct("Disconnected").field("error", error).finish()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Stopped,
}

struct WorkerInner {
    id: String,
    transport: Arc<dyn Transport>,
    launcher: Option<Arc<dyn TestHostLauncher>>,
    events: UnboundedSender<WorkerEvent>,
    phase: Mutex<Phase>,
    stopped: AtomicBool,
    disconnected: AtomicBool,
    shutdown: Notify,
    exit_error: Mutex<Option<OrchestratorError>>,
    process_id: Mutex<Option<u32>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerInner {
    fn emit(&self, event: WorkerEvent) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    fn emit_disconnected(&self, error: Option<OrchestratorError>) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        match &error {
            Some(e) => warn!("Worker {} disconnected: {}", self.id, e),
            None => debug!("Worker {} disconnected", self.id),
        }
        self.emit(WorkerEvent::Disconnected { error });
    }

    async fn fail(&self, error: OrchestratorError) {
        *self.exit_error.lock().await = Some(error);
        self.shutdown.notify_one();
    }
}

/// Handle to one test host process and its channel
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        launcher: Option<Arc<dyn TestHostLauncher>>,
    ) -> (Self, UnboundedReceiver<WorkerEvent>) {
        let (events, receiver) = unbounded_channel();
        let inner = WorkerInner {
            id: id.into(),
            transport,
            launcher,
            events,
            phase: Mutex::new(Phase::Idle),
            stopped: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            shutdown: Notify::new(),
            exit_error: Mutex::new(None),
            process_id: Mutex::new(None),
            kill: Mutex::new(None),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub async fn process_id(&self) -> Option<u32> {
        *self.inner.process_id.lock().await
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        *self.inner.phase.lock().await == Phase::Connected
    }

    /// Start the test host process and watch for its exit
    pub async fn launch(&self, start_info: &TestProcessStartInfo) -> Result<u32> {
        let launcher = self.inner.launcher.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("Worker {} has no launcher", self.inner.id))
        })?;
        if self.is_stopped() {
            return Err(OrchestratorError::InvalidState(format!(
                "Worker {} is stopped",
                self.inner.id
            )));
        }

        let launched = launcher.launch(start_info).await?;
        let process_id = launched.process_id;
        *self.inner.process_id.lock().await = Some(process_id);
        *self.inner.kill.lock().await = Some(launched.kill);

        let inner = Arc::clone(&self.inner);
        let exited = launched.exited;
        tokio::spawn(async move {
            let Ok(exit) = exited.await else {
                return;
            };
            if inner.stopped.load(Ordering::SeqCst) {
                debug!("Test host {} (pid {}) exited after stop", inner.id, process_id);
                return;
            }
            let mut reason = format!(
                "Test host process {} exited with code {}",
                process_id,
                exit.code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            if !exit.stderr.trim().is_empty() {
                reason.push_str(&format!(": {}", exit.stderr.trim()));
            }
            inner.fail(OrchestratorError::TestHost(reason)).await;
        });

        Ok(process_id)
    }

    /// Connect to the worker at `endpoint`, retrying within the transport's window
    ///
    /// On failure the error is also delivered as `Disconnected`.
    pub async fn start(&self, endpoint: &str) -> Result<String> {
        {
            let mut phase = self.inner.phase.lock().await;
            if self.is_stopped() || *phase != Phase::Idle {
                return Err(OrchestratorError::InvalidState(format!(
                    "Worker {} cannot start from {:?}",
                    self.inner.id, *phase
                )));
            }
            *phase = Phase::Connecting;
        }
        debug!("Worker {} connecting to {}", self.inner.id, endpoint);
        let timer = Timer::start(format!("Worker {} connect", self.inner.id));

        let outcome = tokio::select! {
            result = self.inner.transport.connect(endpoint) => result.map_err(Some),
            _ = self.inner.shutdown.notified() => Err(self.inner.exit_error.lock().await.take()),
        };

        let mut phase = self.inner.phase.lock().await;
        match outcome {
            Ok(resolved) if !self.is_stopped() => {
                *phase = Phase::Connected;
                timer.stop();
                info!("Worker {} connected to {}", self.inner.id, resolved);
                self.inner.emit(WorkerEvent::Connected {
                    endpoint: resolved.clone(),
                    channel: Arc::clone(&self.inner.transport),
                });
                drop(phase);

                tokio::spawn(run_message_loop(Arc::clone(&self.inner)));
                Ok(resolved)
            }
            Ok(_) => {
                // stopped while the connection was being established
                *phase = Phase::Stopped;
                let _ = self.inner.transport.disconnect().await;
                self.inner.emit_disconnected(None);
                Err(OrchestratorError::ConnectionClosed)
            }
            Err(error) => {
                *phase = Phase::Stopped;
                self.inner.emit_disconnected(error.clone());
                Err(error.unwrap_or(OrchestratorError::ConnectionClosed))
            }
        }
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        if *self.inner.phase.lock().await != Phase::Connected {
            return Err(OrchestratorError::InvalidState(format!(
                "Worker {} is not connected",
                self.inner.id
            )));
        }
        debug!("Worker {} <- {}", self.inner.id, message);
        self.inner.transport.send(message).await
    }

    /// Stop the message loop and the process; repeated calls are no-ops
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Stopping worker {}", self.inner.id);
        self.inner.shutdown.notify_one();

        if let Some(kill) = self.inner.kill.lock().await.take() {
            let _ = kill.send(());
        }

        let mut phase = self.inner.phase.lock().await;
        if *phase == Phase::Idle {
            *phase = Phase::Stopped;
            self.inner.emit_disconnected(None);
        }
    }
}

async fn run_message_loop(inner: Arc<WorkerInner>) {
    let error = loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break inner.exit_error.lock().await.take(),
            received = inner.transport.receive() => match received {
                Ok(message) => {
                    debug!("Worker {} -> {}", inner.id, message);
                    inner.emit(WorkerEvent::Message(message));
                }
                Err(OrchestratorError::ConnectionClosed) if inner.stopped.load(Ordering::SeqCst) => {
                    break None;
                }
                Err(e) => break Some(e),
            },
        }
    };

    let _ = inner.transport.disconnect().await;
    *inner.phase.lock().await = Phase::Stopped;
    inner.emit_disconnected(error);
}
