//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;
use std::time::Duration;

use super::OrchestratorConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "TEST_ORCHESTRATOR";

/// Seconds a worker-side handler waits for a peer to connect
pub const CONNECTION_TIMEOUT_ENV: &str = "TEST_ORCHESTRATOR_CONNECTION_TIMEOUT";

pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 90;

/// Connection timeout from the environment, falling back to 90 seconds
pub fn connection_timeout() -> Duration {
    let secs = get_env_parse::<u64>("CONNECTION_TIMEOUT")
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// TEST_ORCHESTRATOR_PARALLEL_LEVEL
    pub parallel_level: Option<usize>,
    /// TEST_ORCHESTRATOR_SHARED_HOSTS
    pub shared_hosts: Option<bool>,
    /// TEST_ORCHESTRATOR_IN_PROCESS
    pub in_process: Option<bool>,
    /// TEST_ORCHESTRATOR_CONNECTION_TIMEOUT
    pub connection_timeout_secs: Option<u64>,
    /// TEST_ORCHESTRATOR_WORKER_CONNECT_TIMEOUT
    pub worker_connect_timeout_secs: Option<u64>,
    /// TEST_ORCHESTRATOR_TESTHOST
    pub testhost_executable: Option<String>,
    /// TEST_ORCHESTRATOR_CONFIG
    pub config_file: Option<String>,
    /// TEST_ORCHESTRATOR_LOG
    pub log_level: Option<String>,
    /// TEST_ORCHESTRATOR_LOG_FORMAT
    pub log_format: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            parallel_level: get_env_parse("PARALLEL_LEVEL"),
            shared_hosts: get_env_bool("SHARED_HOSTS"),
            in_process: get_env_bool("IN_PROCESS"),
            connection_timeout_secs: get_env_parse("CONNECTION_TIMEOUT"),
            worker_connect_timeout_secs: get_env_parse("WORKER_CONNECT_TIMEOUT"),
            testhost_executable: get_env("TESTHOST"),
            config_file: get_env("CONFIG"),
            log_level: get_env("LOG"),
            log_format: get_env("LOG_FORMAT"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.parallel_level.is_some()
            || self.shared_hosts.is_some()
            || self.in_process.is_some()
            || self.connection_timeout_secs.is_some()
            || self.worker_connect_timeout_secs.is_some()
            || self.testhost_executable.is_some()
            || self.config_file.is_some()
            || self.log_level.is_some()
            || self.log_format.is_some()
    }

    /// Override `config` with every variable that is set
    pub fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(level) = self.parallel_level {
            config.parallel_level = level;
        }
        if let Some(shared) = self.shared_hosts {
            config.shared_hosts = shared;
        }
        if let Some(in_process) = self.in_process {
            config.in_process = in_process;
        }
        if let Some(secs) = self.connection_timeout_secs.filter(|secs| *secs > 0) {
            config.connection_timeout_secs = secs;
        }
        if let Some(secs) = self.worker_connect_timeout_secs.filter(|secs| *secs > 0) {
            config.worker_connect_timeout_secs = secs;
        }
        if let Some(executable) = &self.testhost_executable {
            config.testhost.executable = executable.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format.as_deref().and_then(|f| f.parse().ok()) {
            config.log_format = format;
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn parallel_level(mut self, level: usize) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_PARALLEL_LEVEL"), level.to_string()));
        self
    }

    pub fn shared_hosts(mut self, shared: bool) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_SHARED_HOSTS"), shared.to_string()));
        self
    }

    pub fn connection_timeout(mut self, secs: u64) -> Self {
        self.vars
            .push((CONNECTION_TIMEOUT_ENV.to_string(), secs.to_string()));
        self
    }

    pub fn testhost(mut self, executable: impl Into<String>) -> Self {
        self.vars
            .push((format!("{ENV_PREFIX}_TESTHOST"), executable.into()));
        self
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
