//! Discovery and run criteria
//!
//! Run settings are carried as an opaque string and passed through to the
//! test hosts untouched.

use serde::{Deserialize, Serialize};

use super::TestCase;

/// What to discover
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryCriteria {
    pub sources: Vec<String>,
    #[serde(default)]
    pub run_settings: Option<String>,
    #[serde(default)]
    pub test_case_filter: Option<String>,
    /// Number of tests batched into one discovered-tests event
    #[serde(default = "default_frequency")]
    pub frequency_of_discovered_test_events: usize,
}

fn default_frequency() -> usize {
    10
}

impl DiscoveryCriteria {
    pub fn new(sources: Vec<String>) -> Self {
        Self {
            sources,
            run_settings: None,
            test_case_filter: None,
            frequency_of_discovered_test_events: default_frequency(),
        }
    }

    pub fn with_run_settings(mut self, settings: impl Into<String>) -> Self {
        self.run_settings = Some(settings.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.test_case_filter = Some(filter.into());
        self
    }

    /// Copy of these criteria narrowed to a single source
    pub fn for_source(&self, source: &str) -> Self {
        Self {
            sources: vec![source.to_string()],
            ..self.clone()
        }
    }
}

/// Tests to run: whole sources, or explicit test cases
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunTarget {
    Sources(Vec<String>),
    Tests(Vec<TestCase>),
}

/// What to run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRunCriteria {
    pub target: TestRunTarget,
    #[serde(default)]
    pub run_settings: Option<String>,
    #[serde(default)]
    pub test_case_filter: Option<String>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "default_frequency")]
    pub frequency_of_run_stats_change_event: usize,
}

impl TestRunCriteria {
    pub fn with_sources(sources: Vec<String>) -> Self {
        Self::new(TestRunTarget::Sources(sources))
    }

    pub fn with_tests(tests: Vec<TestCase>) -> Self {
        Self::new(TestRunTarget::Tests(tests))
    }

    fn new(target: TestRunTarget) -> Self {
        Self {
            target,
            run_settings: None,
            test_case_filter: None,
            keep_alive: false,
            frequency_of_run_stats_change_event: default_frequency(),
        }
    }

    pub fn with_run_settings(mut self, settings: impl Into<String>) -> Self {
        self.run_settings = Some(settings.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn has_specific_sources(&self) -> bool {
        matches!(self.target, TestRunTarget::Sources(_))
    }

    pub fn has_specific_tests(&self) -> bool {
        matches!(self.target, TestRunTarget::Tests(_))
    }

    /// Distinct sources in first-appearance order
    pub fn sources(&self) -> Vec<String> {
        match &self.target {
            TestRunTarget::Sources(sources) => {
                let mut unique: Vec<String> = Vec::with_capacity(sources.len());
                for source in sources {
                    if !unique.contains(source) {
                        unique.push(source.clone());
                    }
                }
                unique
            }
            TestRunTarget::Tests(_) => self
                .tests_by_source()
                .into_iter()
                .map(|(source, _)| source)
                .collect(),
        }
    }

    /// Explicit tests grouped by their source, preserving first-appearance order
    pub fn tests_by_source(&self) -> Vec<(String, Vec<TestCase>)> {
        let mut groups: Vec<(String, Vec<TestCase>)> = Vec::new();
        if let TestRunTarget::Tests(tests) = &self.target {
            for test in tests {
                match groups.iter_mut().find(|(source, _)| *source == test.source) {
                    Some((_, group)) => group.push(test.clone()),
                    None => groups.push((test.source.clone(), vec![test.clone()])),
                }
            }
        }
        groups
    }

    /// Copy of these criteria with a different target
    pub fn retarget(&self, target: TestRunTarget) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }
}
