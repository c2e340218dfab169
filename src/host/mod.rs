//! Test host processes
//!
//! Runtime providers describe how to start a test host, launchers start
//! it, and [`WorkerHandle`] owns the connection to a running host.

pub mod launcher;
pub mod runtime;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use launcher::{LaunchedProcess, ProcessExit, ProcessLauncher, TestHostLauncher};
pub use runtime::{DefaultTestRuntimeProvider, RuntimeProviderRegistry, TestRuntimeProvider};
pub use worker::{WorkerEvent, WorkerHandle};

/// How to start a test host process
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestProcessStartInfo {
    pub file_name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
}

impl TestProcessStartInfo {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.insert(key.into(), value.into());
        self
    }
}
