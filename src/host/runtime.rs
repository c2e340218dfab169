//! Test runtime providers
//!
//! A runtime provider turns a set of sources and a connection endpoint into
//! process start info. Providers are looked up by source file extension.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::TestProcessStartInfo;
use crate::config::TestHostConfig;
use crate::error::{OrchestratorError, Result};

pub trait TestRuntimeProvider: Send + Sync {
    /// Whether one host may serve several sources in sequence
    fn shared(&self) -> bool;

    fn start_info(&self, sources: &[String], endpoint: &str) -> Result<TestProcessStartInfo>;
}

/// Provider that starts the configured test host executable
#[derive(Clone, Debug)]
pub struct DefaultTestRuntimeProvider {
    config: TestHostConfig,
}

impl DefaultTestRuntimeProvider {
    pub fn new(config: TestHostConfig) -> Self {
        Self { config }
    }
}

impl TestRuntimeProvider for DefaultTestRuntimeProvider {
    fn shared(&self) -> bool {
        self.config.shared
    }

    fn start_info(&self, sources: &[String], endpoint: &str) -> Result<TestProcessStartInfo> {
        if self.config.executable.trim().is_empty() {
            return Err(OrchestratorError::Configuration(
                "No test host executable configured".to_string(),
            ));
        }

        let mut arguments = self.config.arguments.clone();
        arguments.extend([
            "--endpoint".to_string(),
            endpoint.to_string(),
            "--parent-process-id".to_string(),
            std::process::id().to_string(),
        ]);

        let working_directory = self.config.working_directory.clone().or_else(|| {
            sources
                .first()
                .and_then(|s| Path::new(s).parent())
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.display().to_string())
        });

        Ok(TestProcessStartInfo {
            file_name: self.config.executable.clone(),
            arguments,
            working_directory,
            environment_variables: self.config.environment.clone(),
        })
    }
}

/// Capability lookup of runtime providers keyed by file extension
#[derive(Clone)]
pub struct RuntimeProviderRegistry {
    by_extension: HashMap<String, Arc<dyn TestRuntimeProvider>>,
    fallback: Arc<dyn TestRuntimeProvider>,
}

impl RuntimeProviderRegistry {
    pub fn new(fallback: Arc<dyn TestRuntimeProvider>) -> Self {
        Self {
            by_extension: HashMap::new(),
            fallback,
        }
    }

    /// Register a provider for an extension such as `dll` or `.so`
    pub fn register(mut self, extension: &str, provider: Arc<dyn TestRuntimeProvider>) -> Self {
        self.by_extension
            .insert(normalize_extension(extension), provider);
        self
    }

    pub fn resolve(&self, source: &str) -> Arc<dyn TestRuntimeProvider> {
        Path::new(source)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.by_extension.get(&normalize_extension(e)))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Provider for a group of sources, decided by the first one
    pub fn resolve_for_sources(&self, sources: &[String]) -> Arc<dyn TestRuntimeProvider> {
        match sources.first() {
            Some(source) => self.resolve(source),
            None => Arc::clone(&self.fallback),
        }
    }
}

fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(executable: &str, shared: bool) -> TestHostConfig {
        TestHostConfig {
            executable: executable.to_string(),
            shared,
            ..Default::default()
        }
    }

    #[test]
    fn test_start_info_includes_endpoint() {
        let provider = DefaultTestRuntimeProvider::new(config("testhost", true));
        let info = provider
            .start_info(&["/work/bin/1.dll".to_string()], "127.0.0.1:4000")
            .unwrap();

        assert_eq!(info.file_name, "testhost");
        let at = info.arguments.iter().position(|a| a == "--endpoint").unwrap();
        assert_eq!(info.arguments[at + 1], "127.0.0.1:4000");
        assert_eq!(info.working_directory.as_deref(), Some("/work/bin"));
        assert!(provider.shared());
    }

    #[test]
    fn test_missing_executable() {
        let provider = DefaultTestRuntimeProvider::new(config("", false));
        let result = provider.start_info(&[], "127.0.0.1:4000");
        assert!(matches!(result, Err(OrchestratorError::Configuration(_))));
    }

    #[test]
    fn test_registry_resolves_by_extension() {
        let fallback: Arc<dyn TestRuntimeProvider> =
            Arc::new(DefaultTestRuntimeProvider::new(config("default-host", true)));
        let native: Arc<dyn TestRuntimeProvider> =
            Arc::new(DefaultTestRuntimeProvider::new(config("native-host", false)));

        let registry = RuntimeProviderRegistry::new(fallback).register(".SO", native);

        let info = registry
            .resolve("libtests.so")
            .start_info(&[], "127.0.0.1:1")
            .unwrap();
        assert_eq!(info.file_name, "native-host");

        let info = registry
            .resolve_for_sources(&["1.dll".to_string()])
            .start_info(&[], "127.0.0.1:1")
            .unwrap();
        assert_eq!(info.file_name, "default-host");
        assert!(!registry.resolve("x.so").shared());
    }
}
