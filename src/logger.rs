//! Channelled structured logging.
//!
//! The core never writes to a concrete log backend. Everything funnels
//! through the [`Logger`] trait: a channel name (taken from the active
//! handler's options), a level, a message, and a flat list of extra fields.
//! [`TracingLogger`] bridges to the `tracing` ecosystem for production use;
//! [`RecordingLogger`] captures entries for assertions in tests.

use std::fmt;
use std::sync::Mutex;

/// Log severity, mirroring the five levels of the logger contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured logger sink consumed by the core.
///
/// `extra` carries structured key/value pairs alongside the message; the
/// sink decides how to render them.
pub trait Logger: Send + Sync {
    fn log(&self, channel: &str, level: LogLevel, message: &str, extra: &[(&str, String)]);
}

/// [`Logger`] that forwards to the `tracing` subscriber.
///
/// The channel and extras become fields on the emitted event. `Critical`
/// maps to `tracing::Level::ERROR` (tracing has no higher level) with a
/// `critical = true` marker field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, channel: &str, level: LogLevel, message: &str, extra: &[(&str, String)]) {
        match level {
            LogLevel::Debug => tracing::debug!(channel, extra = ?extra, "{message}"),
            LogLevel::Info => tracing::info!(channel, extra = ?extra, "{message}"),
            LogLevel::Warning => tracing::warn!(channel, extra = ?extra, "{message}"),
            LogLevel::Error => tracing::error!(channel, extra = ?extra, "{message}"),
            LogLevel::Critical => {
                tracing::error!(channel, critical = true, extra = ?extra, "{message}")
            }
        }
    }
}

/// A single captured log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub channel: String,
    pub level: LogLevel,
    pub message: String,
    pub extra: Vec<(String, String)>,
}

impl LogEntry {
    /// Whether `needle` occurs in the message or any extra value.
    pub fn mentions(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.extra.iter().any(|(_, v)| v.contains(needle))
    }
}

/// [`Logger`] that records every entry in memory.
///
/// Intended for tests and embedded diagnostics. Entries are returned as
/// clones so the sink can keep accepting logs while assertions run.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far, in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("logger lock poisoned").clone()
    }

    /// Entries at the given level.
    pub fn at_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    /// Whether any entry at `level` mentions `needle`.
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.level == level && e.mentions(needle))
    }
}

impl Logger for RecordingLogger {
    fn log(&self, channel: &str, level: LogLevel, message: &str, extra: &[(&str, String)]) {
        let entry = LogEntry {
            channel: channel.to_string(),
            level,
            message: message.to_string(),
            extra: extra
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        };
        self.entries.lock().expect("logger lock poisoned").push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_logger_captures_in_order() {
        let logger = RecordingLogger::new();
        logger.log("default", LogLevel::Info, "first", &[]);
        logger.log("sagas", LogLevel::Error, "second", &[("id", "s-1".to_string())]);

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[1].channel, "sagas");
        assert_eq!(entries[1].extra, vec![("id".to_string(), "s-1".to_string())]);
    }

    #[test]
    fn contains_matches_message_and_extras() {
        let logger = RecordingLogger::new();
        logger.log(
            "default",
            LogLevel::Error,
            "decode failed",
            &[("package_id", "p1".to_string()), ("trace_id", "t1".to_string())],
        );

        assert!(logger.contains(LogLevel::Error, "decode failed"));
        assert!(logger.contains(LogLevel::Error, "p1"));
        assert!(logger.contains(LogLevel::Error, "t1"));
        assert!(!logger.contains(LogLevel::Debug, "p1"));
    }

    #[test]
    fn at_level_filters() {
        let logger = RecordingLogger::new();
        logger.log("a", LogLevel::Debug, "d", &[]);
        logger.log("a", LogLevel::Warning, "w", &[]);

        assert_eq!(logger.at_level(LogLevel::Debug).len(), 1);
        assert_eq!(logger.at_level(LogLevel::Warning).len(), 1);
        assert!(logger.at_level(LogLevel::Critical).is_empty());
    }

    #[test]
    fn level_labels_are_stable() {
        assert_eq!(LogLevel::Debug.as_str(), "debug");
        assert_eq!(LogLevel::Critical.as_str(), "critical");
    }

    #[test]
    fn tracing_logger_accepts_all_levels() {
        // Smoke test: must not panic regardless of subscriber state.
        let logger = TracingLogger;
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warning,
            LogLevel::Error,
            LogLevel::Critical,
        ] {
            logger.log("default", level, "message", &[("k", "v".to_string())]);
        }
    }
}
