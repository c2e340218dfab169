//! Test case and test result models
//!
//! Defines discovered test cases, outcomes and per-test results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A test discovered inside a source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub executor_uri: String,
    pub source: String,
}

impl TestCase {
    pub fn new(
        fully_qualified_name: impl Into<String>,
        executor_uri: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let fully_qualified_name = fully_qualified_name.into();
        Self {
            id: Uuid::new_v4(),
            display_name: fully_qualified_name.clone(),
            fully_qualified_name,
            executor_uri: executor_uri.into(),
            source: source.into(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.source)
    }
}

/// Outcome of a single test
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    #[default]
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

impl TestOutcome {
    pub fn symbol(&self) -> &'static str {
        match self {
            TestOutcome::None => "-",
            TestOutcome::Passed => "✓",
            TestOutcome::Failed => "✗",
            TestOutcome::Skipped => "○",
            TestOutcome::NotFound => "?",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed)
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::None => write!(f, "NONE"),
            TestOutcome::Passed => write!(f, "PASSED"),
            TestOutcome::Failed => write!(f, "FAILED"),
            TestOutcome::Skipped => write!(f, "SKIPPED"),
            TestOutcome::NotFound => write!(f, "NOT FOUND"),
        }
    }
}

/// Result of running one test case
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case: TestCase,
    pub outcome: TestOutcome,
    pub error_message: Option<String>,
    pub duration: Duration,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl TestResult {
    pub fn new(test_case: TestCase, outcome: TestOutcome) -> Self {
        let now = Utc::now();
        Self {
            test_case,
            outcome,
            error_message: None,
            duration: Duration::ZERO,
            start_time: now,
            end_time: now,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self.start_time = self.end_time
            - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        self
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}ms]",
            self.outcome.symbol(),
            self.test_case,
            self.duration.as_millis()
        )?;
        if let Some(msg) = &self.error_message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}
