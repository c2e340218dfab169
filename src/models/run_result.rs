//! Run statistics, attachments and completion arguments

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::{TestCase, TestOutcome, TestResult};

/// Free-form numeric or textual run metrics keyed by name
pub type Metrics = HashMap<String, serde_json::Value>;

/// Counts of executed tests by outcome
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunStatistics {
    pub executed_tests: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub not_found: u64,
}

impl TestRunStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: TestOutcome) {
        self.executed_tests += 1;
        match outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Skipped => self.skipped += 1,
            TestOutcome::NotFound => self.not_found += 1,
            TestOutcome::None => {}
        }
    }

    pub fn from_results(results: &[TestResult]) -> Self {
        let mut stats = Self::new();
        for result in results {
            stats.record(result.outcome);
        }
        stats
    }

    pub fn count(&self, outcome: TestOutcome) -> u64 {
        match outcome {
            TestOutcome::Passed => self.passed,
            TestOutcome::Failed => self.failed,
            TestOutcome::Skipped => self.skipped,
            TestOutcome::NotFound => self.not_found,
            TestOutcome::None => self
                .executed_tests
                .saturating_sub(self.passed + self.failed + self.skipped + self.not_found),
        }
    }

    /// Add another set of counts into this one
    pub fn merge(&mut self, other: &TestRunStatistics) {
        self.executed_tests += other.executed_tests;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.not_found += other.not_found;
    }
}

impl fmt::Display for TestRunStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {} | Passed: {} | Failed: {} | Skipped: {}",
            self.executed_tests, self.passed, self.failed, self.skipped
        )
    }
}

/// A single file or resource produced by a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriDataAttachment {
    pub uri: String,
    #[serde(default)]
    pub description: String,
}

/// Attachments produced by one data collector or test host
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSet {
    pub uri: String,
    pub display_name: String,
    #[serde(default)]
    pub attachments: Vec<UriDataAttachment>,
}

impl AttachmentSet {
    pub fn new(uri: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            display_name: display_name.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, uri: impl Into<String>, description: impl Into<String>) -> Self {
        self.attachments.push(UriDataAttachment {
            uri: uri.into(),
            description: description.into(),
        });
        self
    }
}

/// Incremental progress of a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestRunChangedArgs {
    pub stats: Option<TestRunStatistics>,
    #[serde(default)]
    pub new_test_results: Vec<TestResult>,
    #[serde(default)]
    pub active_tests: Vec<TestCase>,
}

impl TestRunChangedArgs {
    pub fn new(stats: TestRunStatistics, new_test_results: Vec<TestResult>) -> Self {
        Self {
            stats: Some(stats),
            new_test_results,
            active_tests: Vec::new(),
        }
    }
}

/// Terminal state of a run as a tagged value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Canceled,
    Aborted(Option<String>),
    Faulted(String),
}

/// Arguments of a run (or partial run) completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestRunCompleteArgs {
    pub stats: TestRunStatistics,
    pub is_canceled: bool,
    pub is_aborted: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub attachment_sets: Vec<AttachmentSet>,
    pub elapsed: Duration,
}

impl TestRunCompleteArgs {
    pub fn completed(stats: TestRunStatistics, elapsed: Duration) -> Self {
        Self {
            stats,
            elapsed,
            ..Default::default()
        }
    }

    /// An aborted completion with nothing executed
    pub fn aborted(error: Option<String>, elapsed: Duration) -> Self {
        Self {
            is_aborted: true,
            error,
            elapsed,
            ..Default::default()
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.is_aborted {
            RunOutcome::Aborted(self.error.clone())
        } else if self.is_canceled {
            RunOutcome::Canceled
        } else if let Some(error) = &self.error {
            RunOutcome::Faulted(error.clone())
        } else {
            RunOutcome::Completed
        }
    }
}
