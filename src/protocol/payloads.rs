//! Payload shapes carried by protocol messages

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::events::MessageLevel;
use crate::models::{
    AttachmentSet, Metrics, TestCase, TestOutcome, TestRunChangedArgs, TestRunCompleteArgs,
};

/// `start_discovery`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartDiscoveryPayload {
    pub sources: Vec<String>,
    pub run_settings: Option<String>,
    pub test_case_filter: Option<String>,
}

/// `discovery_complete`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryCompletePayload {
    pub total_tests: i64,
    #[serde(default)]
    pub last_discovered_tests: Option<Vec<TestCase>>,
    pub is_aborted: bool,
}

/// `start_test_execution_with_sources` and `start_test_execution_with_tests`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestRunStartPayload {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    pub run_settings: Option<String>,
    pub test_case_filter: Option<String>,
    pub keep_alive: bool,
}

/// `execution_complete`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionCompletePayload {
    pub complete_args: TestRunCompleteArgs,
    #[serde(default)]
    pub last_run_tests: Option<TestRunChangedArgs>,
    #[serde(default)]
    pub run_attachments: Vec<AttachmentSet>,
    #[serde(default)]
    pub metrics: Metrics,
}

/// `test_message`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestMessagePayload {
    pub level: MessageLevel,
    pub message: String,
}

/// `before_test_run_start`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeforeTestRunStartPayload {
    pub settings: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// `before_test_run_start_result`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BeforeTestRunStartResultPayload {
    pub environment_variables: HashMap<String, String>,
    pub are_test_case_events_required: bool,
    /// Port of the per-test-case event channel, 0 when not required
    pub data_collection_events_port: u16,
}

/// `test_host_launched`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestHostLaunchedPayload {
    pub process_id: u32,
}

/// `after_test_run_end`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AfterTestRunEndPayload {
    pub is_cancelled: bool,
}

/// `after_test_run_end_result`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AfterTestRunEndResultPayload {
    pub attachment_sets: Vec<AttachmentSet>,
    #[serde(default)]
    pub metrics: Metrics,
}

/// `data_collection_message`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataCollectionMessagePayload {
    pub level: MessageLevel,
    pub message: String,
    #[serde(default)]
    pub data_collector_uri: Option<String>,
}

/// `test_case_start` and `test_case_end`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCaseEventPayload {
    pub test_case_id: Uuid,
    pub test_case_name: String,
    #[serde(default)]
    pub outcome: Option<TestOutcome>,
    #[serde(default)]
    pub is_child_test_case: bool,
}

impl TestCaseEventPayload {
    pub fn started(test_case: &TestCase) -> Self {
        Self {
            test_case_id: test_case.id,
            test_case_name: test_case.fully_qualified_name.clone(),
            outcome: None,
            is_child_test_case: false,
        }
    }

    pub fn ended(test_case: &TestCase, outcome: TestOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::started(test_case)
        }
    }
}

/// `test_case_end_result`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestCaseEndResultPayload {
    pub attachment_sets: Vec<AttachmentSet>,
}
