//! Folding partial completions into one result

use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::models::{AttachmentSet, Metrics, TestRunCompleteArgs, TestRunStatistics};

#[derive(Debug, Default)]
pub struct DiscoveryDataAggregator {
    total_tests: i64,
    is_aborted: bool,
    partials: usize,
}

impl DiscoveryDataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(&mut self, total_tests: i64, is_aborted: bool) {
        self.partials += 1;
        if is_aborted || total_tests < 0 {
            self.is_aborted = true;
        } else {
            self.total_tests += total_tests;
        }
    }

    pub fn mark_aborted(&mut self) {
        self.is_aborted = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.is_aborted
    }

    pub fn partials(&self) -> usize {
        self.partials
    }

    /// Total to report; -1 once anything aborted
    pub fn total_tests(&self) -> i64 {
        if self.is_aborted {
            -1
        } else {
            self.total_tests
        }
    }
}

#[derive(Debug, Default)]
pub struct RunDataAggregator {
    stats: TestRunStatistics,
    is_canceled: bool,
    is_aborted: bool,
    errors: Vec<String>,
    attachments: Vec<AttachmentSet>,
    metrics: Metrics,
    elapsed: Duration,
    partials: usize,
}

impl RunDataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(
        &mut self,
        complete: &TestRunCompleteArgs,
        attachments: Vec<AttachmentSet>,
        metrics: Metrics,
    ) {
        self.partials += 1;
        self.stats.merge(&complete.stats);
        self.is_canceled |= complete.is_canceled;
        self.is_aborted |= complete.is_aborted;
        if let Some(error) = &complete.error {
            self.errors.push(error.clone());
        }
        self.attachments
            .extend(complete.attachment_sets.iter().cloned());
        self.attachments.extend(attachments);
        self.elapsed = self.elapsed.max(complete.elapsed);

        for (key, value) in metrics {
            let merged = match (self.metrics.get(&key), &value) {
                (Some(JsonValue::Number(a)), JsonValue::Number(b)) => sum_numbers(a, b),
                _ => value,
            };
            self.metrics.insert(key, merged);
        }
    }

    pub fn mark_canceled(&mut self) {
        self.is_canceled = true;
    }

    pub fn mark_aborted(&mut self) {
        self.is_aborted = true;
    }

    pub fn partials(&self) -> usize {
        self.partials
    }

    pub fn stats(&self) -> &TestRunStatistics {
        &self.stats
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Build the caller-facing completion and hand over the attachments
    pub fn finish(&mut self) -> (TestRunCompleteArgs, Vec<AttachmentSet>, Metrics) {
        let complete = TestRunCompleteArgs {
            stats: self.stats.clone(),
            is_canceled: self.is_canceled,
            is_aborted: self.is_aborted,
            error: (!self.errors.is_empty()).then(|| self.errors.join("\n")),
            attachment_sets: Vec::new(),
            elapsed: self.elapsed,
        };
        (
            complete,
            std::mem::take(&mut self.attachments),
            std::mem::take(&mut self.metrics),
        )
    }
}

fn sum_numbers(a: &serde_json::Number, b: &serde_json::Number) -> JsonValue {
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => JsonValue::from(a.saturating_add(b)),
        _ => {
            let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
            serde_json::Number::from_f64(sum)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null)
        }
    }
}
