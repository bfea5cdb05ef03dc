//! Structured logging boundary contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Log level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

impl LogLevel {
    /// Lowercase name used on the wire and in config.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Unknown log level name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLogLevel(pub Box<str>);

impl fmt::Display for UnknownLogLevel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "unknown log level `{}` (expected debug|info|warn|error)",
            self.0
        )
    }
}

impl std::error::Error for UnknownLogLevel {}

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(UnknownLogLevel(other.into())),
        }
    }
}

/// Additional event fields.
pub type LogFields = BTreeMap<Box<str>, serde_json::Value>;

/// Structured log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Stable event name.
    pub event: Box<str>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message (safe, redacted).
    pub message: Box<str>,
    /// Optional structured fields.
    pub fields: Option<LogFields>,
    /// Optional error payload.
    pub error: Option<serde_json::Value>,
}

impl LogEvent {
    /// Build an event without error payload.
    #[must_use]
    pub fn new(level: LogLevel, event: &str, message: &str, fields: Option<LogFields>) -> Self {
        Self {
            event: event.into(),
            level,
            message: message.into(),
            fields,
            error: None,
        }
    }

    /// Attach an error payload.
    #[must_use]
    pub fn with_error(mut self, error: serde_json::Value) -> Self {
        self.error = Some(error);
        self
    }
}

/// Boundary contract for structured logging.
pub trait LoggerPort: Send + Sync {
    /// Emit a structured event.
    fn log(&self, event: LogEvent);

    /// Create a child logger with base fields applied to every event.
    fn child(&self, fields: LogFields) -> Box<dyn LoggerPort>;

    /// Convenience: debug event.
    fn debug(&self, event: &str, message: &str, fields: Option<LogFields>) {
        self.log(LogEvent::new(LogLevel::Debug, event, message, fields));
    }

    /// Convenience: info event.
    fn info(&self, event: &str, message: &str, fields: Option<LogFields>) {
        self.log(LogEvent::new(LogLevel::Info, event, message, fields));
    }

    /// Convenience: warn event.
    fn warn(&self, event: &str, message: &str, fields: Option<LogFields>) {
        self.log(LogEvent::new(LogLevel::Warn, event, message, fields));
    }

    /// Convenience: error event.
    fn error(&self, event: &str, message: &str, fields: Option<LogFields>) {
        self.log(LogEvent::new(LogLevel::Error, event, message, fields));
    }
}
