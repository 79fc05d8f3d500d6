//! Logging utilities for request-insights.
//!
//! A thin facade over [`tracing`] that adds a per-module prefix and an extra
//! level gate driven by `APPINSIGHTS_LOG_LEVEL` (falling back to `LOG_LEVEL`).
//! The gate lets operators silence the middleware's own diagnostics without
//! touching the host application's subscriber filter.
//!
//! # Static Logger Example
//! ```
//! use request_insights::logger::Logger;
//!
//! static LOGGER: Logger = Logger::const_new("my_module");
//!
//! LOGGER.info("Starting module");
//! ```

use crate::constants::env_vars;
use std::env;
use std::sync::OnceLock;

// Global log level cache
static LOG_LEVEL: OnceLock<Level> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    None,
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "none" => Some(Level::None),
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            _ => None,
        }
    }
}

/// Get the log level from environment variables
fn get_log_level() -> Level {
    *LOG_LEVEL.get_or_init(|| {
        env::var(env_vars::LOG_LEVEL)
            .or_else(|_| env::var("LOG_LEVEL"))
            .ok()
            .and_then(|level| Level::parse(&level))
            .unwrap_or(Level::Info)
    })
}

/// Logger with level filtering and consistent prefixing
#[derive(Debug, Clone)]
pub struct Logger {
    prefix: &'static str,
}

impl Logger {
    /// Create a new logger with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Box::leak(prefix.into().into_boxed_str()),
        }
    }

    /// Create a new logger with the given prefix that can be used in const contexts
    pub const fn const_new(prefix: &'static str) -> Self {
        Self { prefix }
    }

    fn should_log(&self, level: Level) -> bool {
        level != Level::None && level <= get_log_level()
    }

    fn format_message(&self, message: &str) -> String {
        format!("[{}] {}", self.prefix, message)
    }

    /// Log a debug message
    pub fn debug(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Debug) {
            tracing::debug!(logger = self.prefix, "{}", self.format_message(message.as_ref()));
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Info) {
            tracing::info!(logger = self.prefix, "{}", self.format_message(message.as_ref()));
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Warn) {
            tracing::warn!(logger = self.prefix, "{}", self.format_message(message.as_ref()));
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl AsRef<str>) {
        if self.should_log(Level::Error) {
            tracing::error!(logger = self.prefix, "{}", self.format_message(message.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse("warn"), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::None));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn test_none_is_never_logged() {
        let logger = Logger::new("test");
        assert!(!logger.should_log(Level::None));
        assert!(logger.should_log(Level::Error));
    }

    #[test]
    fn test_format_message() {
        let logger = Logger::const_new("test");

        assert_eq!(logger.format_message("hello"), "[test] hello");
    }
}
