//! Error types for the orchestration core
//!
//! Session and protocol failures are carried as values so that callers
//! handle aborted and faulted outcomes explicitly.

use thiserror::Error;

/// Errors raised by workers, proxies, pools and protocol handlers
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("{client} process failed to connect to {server} process after {timeout_secs} seconds. This may occur due to machine slowness, please set environment variable {env_var} to increase timeout.")]
    ConnectionTimeout {
        client: String,
        server: String,
        timeout_secs: u64,
        env_var: String,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Test host error: {0}")]
    TestHost(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("One or more errors occurred: {}", join_errors(.0))]
    Aggregate(Vec<OrchestratorError>),
}

impl OrchestratorError {
    /// Collapse collected errors: none is success, one is returned as is
    pub fn from_errors(mut errors: Vec<OrchestratorError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(OrchestratorError::Aggregate(errors)),
        }
    }

    /// Whether this error is (or wraps) a connection timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            OrchestratorError::ConnectionTimeout { .. } => true,
            OrchestratorError::Aggregate(inner) => inner.iter().any(|e| e.is_timeout()),
            _ => false,
        }
    }
}

fn join_errors(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| format!("({e})"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => OrchestratorError::ConnectionClosed,
            _ => OrchestratorError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
