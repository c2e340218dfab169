//! Tracing subscriber setup
//!
//! Events from this crate are filtered at the configured level. Extra
//! `target=level` directives can raise or lower other targets, such as the
//! transport's dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const CRATE_TARGET: &str = "test_orchestrator";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

/// Line layout of emitted events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per event, span fields folded in
    #[default]
    Compact,
    /// Span context printed before each event
    Full,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "full" => Ok(LogFormat::Full),
            other => Err(format!("Unknown log format: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggerOptions {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Print the emitting module with each event
    pub with_target: bool,
    /// Additional filter directives, e.g. `tokio=debug`
    pub directives: Vec<String>,
}

impl LoggerOptions {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            format: LogFormat::Compact,
            with_target: false,
            directives: Vec::new(),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::new(self.to_string())
    }
}

/// The filter string handed to [`EnvFilter`]
impl fmt::Display for LoggerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CRATE_TARGET}={}", self.level.to_tracing_level())?;
        for directive in self.directives.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
            write!(f, ",{directive}")?;
        }
        Ok(())
    }
}

/// Install a compact subscriber for this crate at `level`
///
/// Returns false when a global subscriber was already installed.
pub fn init_logger(level: LogLevel) -> bool {
    init_logger_with(&LoggerOptions::new(level))
}

pub fn init_logger_with(options: &LoggerOptions) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(options.filter())
        .with_target(options.with_target);

    match options.format {
        LogFormat::Compact => builder.compact().try_init().is_ok(),
        LogFormat::Full => builder.try_init().is_ok(),
    }
}
