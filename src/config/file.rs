//! Configuration file management
//!
//! Handles finding, loading, and validating configuration files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{OrchestratorConfig, TestHostConfig};

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./test-orchestrator.yaml",
    "./test-orchestrator.yml",
    "./.test-orchestrator.yaml",
    "~/.config/test-orchestrator/config.yaml",
    "~/.test-orchestrator.yaml",
];

/// Test host used for sources with a given extension
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Source extension without the dot, e.g. "dll"
    pub extension: String,
    pub testhost: TestHostConfig,
}

/// Full configuration file structure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Version of config file format
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Per-extension test hosts; anything else uses `orchestrator.testhost`
    #[serde(default)]
    pub runtimes: Vec<RuntimeConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            orchestrator: OrchestratorConfig::default(),
            runtimes: Vec::new(),
        }
    }
}

impl ConfigFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        match Self::find() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !["1.0"].contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.parallel_level == 0 {
            anyhow::bail!("parallel_level must be at least 1");
        }
        if orchestrator.worker_connect_timeout_secs == 0 {
            anyhow::bail!("worker_connect_timeout_secs must be greater than 0");
        }
        if orchestrator.connection_timeout_secs == 0 {
            anyhow::bail!("connection_timeout_secs must be greater than 0");
        }
        if orchestrator.connect_retry_interval_ms == 0 {
            anyhow::bail!("connect_retry_interval_ms must be greater than 0");
        }

        for runtime in &self.runtimes {
            if runtime.extension.trim_start_matches('.').is_empty() {
                anyhow::bail!("Runtime entry has an empty extension");
            }
            if runtime.testhost.executable.trim().is_empty() {
                anyhow::bail!(
                    "Runtime for '.{}' has no test host executable",
                    runtime.extension.trim_start_matches('.')
                );
            }
        }

        Ok(())
    }

    pub fn example() -> Self {
        Self {
            version: "1.0".to_string(),
            orchestrator: OrchestratorConfig {
                parallel_level: 4,
                shared_hosts: true,
                testhost: TestHostConfig {
                    executable: "testhost".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            runtimes: vec![RuntimeConfig {
                extension: "py".to_string(),
                testhost: TestHostConfig {
                    executable: "python3".to_string(),
                    arguments: vec!["-m".to_string(), "testhost".to_string()],
                    shared: false,
                    ..Default::default()
                },
            }],
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Check if file is YAML based on extension
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
