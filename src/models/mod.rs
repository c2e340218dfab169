//! Data models for test orchestration
//!
//! This module contains the data structures exchanged between the caller,
//! the parallel managers and the test hosts.

mod criteria;
mod run_result;
mod test_result;

pub use criteria::{DiscoveryCriteria, TestRunCriteria, TestRunTarget};
pub use run_result::{
    AttachmentSet, Metrics, RunOutcome, TestRunChangedArgs, TestRunCompleteArgs,
    TestRunStatistics, UriDataAttachment,
};
pub use test_result::{TestCase, TestOutcome, TestResult};
