//! Shared utilities

pub mod logger;
pub mod timer;

pub use logger::{init_logger, init_logger_with, LogFormat, LogLevel, LoggerOptions};
pub use timer::{Stopwatch, Timer};
