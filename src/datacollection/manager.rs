//! Data collector lifecycle on the worker side

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::AttachmentSet;
use crate::protocol::TestCaseEventPayload;

/// Loads data collectors and relays session and test case events to them
#[async_trait]
pub trait DataCollectionManager: Send + Sync {
    /// Load the collectors named in `settings`; returns environment
    /// variables the test host must be started with
    async fn load_data_collectors(&self, settings: &str) -> HashMap<String, String>;

    /// Returns true when any collector wants test case level events
    async fn session_started(&self) -> bool;

    async fn test_case_started(&self, event: &TestCaseEventPayload);

    async fn test_case_ended(&self, event: &TestCaseEventPayload) -> Vec<AttachmentSet>;

    async fn session_ended(&self, is_cancelled: bool) -> Vec<AttachmentSet>;

    async fn test_host_launched(&self, process_id: u32);

    async fn dispose(&self);
}
