//! Configuration module
//!
//! Handles loading and managing configuration.

pub mod env;
pub mod file;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub use env::{connection_timeout, EnvBuilder, EnvConfig, EnvGuard, CONNECTION_TIMEOUT_ENV};
pub use file::{ConfigFile, RuntimeConfig};

use crate::utils::{init_logger_with, LogFormat, LogLevel, LoggerOptions};

/// Orchestrator settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of test hosts running at once
    pub parallel_level: usize,

    /// Let a test host serve several sources in sequence
    pub shared_hosts: bool,

    /// Run tests inside the controller when an engine is available
    pub in_process: bool,

    /// How long the controller retries connecting to a test host
    pub worker_connect_timeout_secs: u64,

    pub connect_retry_interval_ms: u64,

    /// How long worker-side handlers wait for their peer
    pub connection_timeout_secs: u64,

    /// Times a refused unit of work is handed to a fresh proxy
    pub dispatch_retry_limit: usize,

    pub log_level: String,

    pub log_format: LogFormat,

    /// Print the emitting module with each log line
    pub log_targets: bool,

    /// Extra tracing filter directives, e.g. `tokio=debug`
    pub log_directives: Vec<String>,

    pub testhost: TestHostConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallel_level: 1,
            shared_hosts: true,
            in_process: false,
            worker_connect_timeout_secs: 50,
            connect_retry_interval_ms: 100,
            connection_timeout_secs: env::DEFAULT_CONNECTION_TIMEOUT_SECS,
            dispatch_retry_limit: 1,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            log_targets: false,
            log_directives: Vec::new(),
            testhost: TestHostConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Self = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = if is_yaml(path.as_ref()) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Defaults, then the config file (if any), then environment overrides
    pub fn resolve() -> Result<Self> {
        let env = EnvConfig::load();
        let mut config = match &env.config_file {
            Some(path) => ConfigFile::load(path)?.orchestrator,
            None => ConfigFile::load_default()?.orchestrator,
        };
        env.apply(&mut config);
        Ok(config)
    }

    pub fn worker_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_connect_timeout_secs)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Configured log level, `Info` when unrecognised
    pub fn log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or(LogLevel::Info)
    }

    pub fn logger_options(&self) -> LoggerOptions {
        let options = LoggerOptions::new(self.log_level())
            .with_format(self.log_format)
            .with_target(self.log_targets);
        self.log_directives
            .iter()
            .fold(options, |options, directive| options.with_directive(directive.as_str()))
    }

    /// Install the tracing subscriber described by the log settings
    pub fn init_logging(&self) -> bool {
        init_logger_with(&self.logger_options())
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

/// How to start a test host process
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestHostConfig {
    pub executable: String,

    /// Arguments placed before the connection arguments
    pub arguments: Vec<String>,

    pub working_directory: Option<String>,

    pub environment: HashMap<String, String>,

    /// Whether one host may serve several sources in sequence
    pub shared: bool,
}
