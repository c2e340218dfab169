//! Test Orchestrator - parallel test host orchestration core
//!
//! Discovers and runs tests across a pool of isolated test host
//! processes and aggregates their results into a single stream of events
//! for the caller.
//!
//! ## Features
//!
//! - Worker process handle with connect retry and disconnect detection
//! - Discovery and execution proxies, one test host per proxy
//! - Parallel managers that spread sources over a resizable proxy pool
//! - Worker-side data collection session handler
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use test_orchestrator::{DiscoveryCriteria, OrchestratorConfig, ProxyDiscoveryManager, TestEngine};
//! # async fn run(handler: Arc<dyn test_orchestrator::DiscoveryEventsHandler>) -> test_orchestrator::Result<()> {
//! let engine = TestEngine::new(OrchestratorConfig::default());
//! let sources = vec!["a.dll".to_string(), "b.dll".to_string()];
//! let manager = engine.discovery_manager(&sources);
//! manager.discover_tests(DiscoveryCriteria::new(sources), handler).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod datacollection;
pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod models;
pub mod parallel;
pub mod protocol;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use client::{
    ExecutionEngine, ProxyDiscoveryManager, ProxyExecutionManager, ProxyLifecycle,
};
pub use config::{ConfigFile, OrchestratorConfig, TestHostConfig};
pub use datacollection::{DataCollectionManager, DataCollectionRequestHandler};
pub use engine::TestEngine;
pub use error::{OrchestratorError, Result};
pub use events::{DiscoveryEventsHandler, MessageLevel, RunEventsHandler};
pub use models::{DiscoveryCriteria, TestCase, TestRunCriteria};
pub use parallel::{ParallelProxyDiscoveryManager, ParallelProxyExecutionManager};
