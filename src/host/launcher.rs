//! Test host process launching
//!
//! A launcher starts a process and hands back its id, a one-shot exit
//! notification and a kill switch.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::TestProcessStartInfo;
use crate::error::{OrchestratorError, Result};

/// Keep only the tail of stderr for error reports
const STDERR_TAIL_BYTES: usize = 4096;

/// How a launched process ended
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub stderr: String,
}

#[derive(Debug)]
pub struct LaunchedProcess {
    pub process_id: u32,
    pub exited: oneshot::Receiver<ProcessExit>,
    pub kill: oneshot::Sender<()>,
}

#[async_trait]
pub trait TestHostLauncher: Send + Sync {
    async fn launch(&self, start_info: &TestProcessStartInfo) -> Result<LaunchedProcess>;
}

/// Launches test hosts as child processes
#[derive(Clone, Debug, Default)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TestHostLauncher for ProcessLauncher {
    async fn launch(&self, start_info: &TestProcessStartInfo) -> Result<LaunchedProcess> {
        let mut command = Command::new(&start_info.file_name);
        command
            .args(&start_info.arguments)
            .envs(&start_info.environment_variables)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &start_info.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::TestHost(format!("Failed to start {}: {e}", start_info.file_name))
        })?;
        let process_id = child.id().ok_or_else(|| {
            OrchestratorError::TestHost(format!(
                "{} exited before reporting a process id",
                start_info.file_name
            ))
        })?;
        info!("Launched test host {} (pid {})", start_info.file_name, process_id);

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            };
            let code = match waited {
                Some(status) => status.ok().and_then(|s| s.code()),
                None => {
                    debug!("Killing test host (pid {})", process_id);
                    let _ = child.kill().await;
                    None
                }
            };
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let _ = exit_tx.send(ProcessExit { code, stderr });
        });

        Ok(LaunchedProcess {
            process_id,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Drain `reader`, keeping at most the last `limit` bytes
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail = VecDeque::with_capacity(limit);
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend(&chunk[..n]);
                let excess = tail.len().saturating_sub(limit);
                tail.drain(..excess);
            }
        }
    }
    String::from_utf8_lossy(tail.make_contiguous()).into_owned()
}
