//! Caller-facing event handler interfaces
//!
//! Discovery and run results flow back to the caller through these
//! handlers. Parallel managers wrap them per proxy to intercept partial
//! completions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{AttachmentSet, Metrics, TestCase, TestRunChangedArgs, TestRunCompleteArgs};

/// Severity of a log message raised during discovery or execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Informational,
    Warning,
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLevel::Informational => write!(f, "INFO"),
            MessageLevel::Warning => write!(f, "WARN"),
            MessageLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[async_trait]
pub trait DiscoveryEventsHandler: Send + Sync {
    async fn handle_discovered_tests(&self, tests: Vec<TestCase>);

    /// `total_tests` is -1 when discovery was aborted
    async fn handle_discovery_complete(
        &self,
        total_tests: i64,
        last_chunk: Option<Vec<TestCase>>,
        is_aborted: bool,
    );

    async fn handle_log_message(&self, level: MessageLevel, message: String);
}

#[async_trait]
pub trait RunEventsHandler: Send + Sync {
    async fn handle_test_run_stats_change(&self, args: TestRunChangedArgs);

    async fn handle_test_run_complete(
        &self,
        complete: TestRunCompleteArgs,
        last_chunk: Option<TestRunChangedArgs>,
        attachments: Vec<AttachmentSet>,
        metrics: Metrics,
    );

    async fn handle_log_message(&self, level: MessageLevel, message: String);
}
