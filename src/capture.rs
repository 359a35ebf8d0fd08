//! Per-request log capture
//!
//! Handlers log through a [`RequestLogger`]. Every record is delivered twice:
//! appended to the request-local sink (persisted later if the request fails)
//! and forwarded to `tracing` so normal log output is unaffected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Mutex};

use crate::context::current_millis;

/// Log level for captured request logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured log record
#[derive(Debug, Clone)]
pub struct CapturedRecord {
    pub level: LogLevel,
    /// Call site as "file:line"
    pub file_path: String,
    /// Symbol of the handler that owns the request
    pub func_name: String,
    /// Unix milliseconds
    pub timestamp: u64,
    pub message: String,
}

/// Request-local, order-preserving buffer of captured records
///
/// Appends must never fail a request, so a poisoned lock is absorbed rather
/// than propagated.
#[derive(Debug, Default)]
pub struct LogSink {
    records: Mutex<Vec<CapturedRecord>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: CapturedRecord) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(record);
    }

    /// Drain all records in append order
    pub fn flush(&self) -> Vec<CapturedRecord> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *records)
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named logger handle bound to one request's capture sink
#[derive(Clone)]
pub struct RequestLogger {
    name: String,
    request_id: String,
    func_name: String,
    sink: Arc<LogSink>,
}

impl RequestLogger {
    /// Create a logger with a fresh sink. Called by the tagger; a new request
    /// always starts with an empty buffer.
    pub fn new(
        name: impl Into<String>,
        request_id: impl Into<String>,
        func_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            request_id: request_id.into(),
            func_name: func_name.into(),
            sink: Arc::new(LogSink::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[track_caller]
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message.into(), Location::caller());
    }

    #[track_caller]
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into(), Location::caller());
    }

    #[track_caller]
    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into(), Location::caller());
    }

    #[track_caller]
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into(), Location::caller());
    }

    #[track_caller]
    pub fn critical(&self, message: impl Into<String>) {
        self.log(LogLevel::Critical, message.into(), Location::caller());
    }

    fn log(&self, level: LogLevel, message: String, location: &Location<'_>) {
        // Forward to tracing first so output appears even if nothing is
        // persisted later. CRITICAL has no tracing equivalent and maps to
        // error with an explicit level field.
        match level {
            LogLevel::Debug => tracing::debug!(
                request_id = %self.request_id,
                logger = %self.name,
                "{}", message
            ),
            LogLevel::Info => tracing::info!(
                request_id = %self.request_id,
                logger = %self.name,
                "{}", message
            ),
            LogLevel::Warning => tracing::warn!(
                request_id = %self.request_id,
                logger = %self.name,
                "{}", message
            ),
            LogLevel::Error => tracing::error!(
                request_id = %self.request_id,
                logger = %self.name,
                "{}", message
            ),
            LogLevel::Critical => tracing::error!(
                request_id = %self.request_id,
                logger = %self.name,
                level = "CRITICAL",
                "{}", message
            ),
        }

        self.sink.push(CapturedRecord {
            level,
            file_path: format!("{}:{}", location.file(), location.line()),
            func_name: self.func_name.clone(),
            timestamp: current_millis(),
            message,
        });
    }

    /// Drain the captured records in chronological (append) order
    pub fn flush(&self) -> Vec<CapturedRecord> {
        self.sink.flush()
    }

    pub fn captured_count(&self) -> usize {
        self.sink.len()
    }
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogger")
            .field("name", &self.name)
            .field("request_id", &self.request_id)
            .field("captured", &self.sink.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> RequestLogger {
        RequestLogger::new("apm", "req-1", "create_poll")
    }

    #[test]
    fn test_sink_preserves_append_order() {
        let logger = test_logger();

        logger.info("first");
        logger.warning("second");
        logger.error("third");

        let records = logger.flush();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].message, "first");
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[1].message, "second");
        assert_eq!(records[1].level, LogLevel::Warning);
        assert_eq!(records[2].message, "third");
        assert_eq!(records[2].level, LogLevel::Error);
    }

    #[test]
    fn test_flush_drains_the_sink() {
        let logger = test_logger();

        logger.debug("once");
        assert_eq!(logger.flush().len(), 1);
        assert!(logger.flush().is_empty());
    }

    #[test]
    fn test_records_carry_call_site_and_handler() {
        let logger = test_logger();

        logger.critical("boom");

        let records = logger.flush();
        assert!(records[0].file_path.contains("capture.rs"));
        assert_eq!(records[0].func_name, "create_poll");
        assert!(records[0].timestamp > 0);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(LogLevel::Debug.as_str(), "DEBUG");
        assert_eq!(LogLevel::Warning.as_str(), "WARNING");
        assert_eq!(LogLevel::Critical.to_string(), "CRITICAL");
    }

    #[test]
    fn test_clones_share_one_sink() {
        let logger = test_logger();
        let clone = logger.clone();

        logger.info("from original");
        clone.info("from clone");

        assert_eq!(logger.captured_count(), 2);
        assert_eq!(logger.flush().len(), 2);
        assert_eq!(clone.captured_count(), 0);
    }
}
