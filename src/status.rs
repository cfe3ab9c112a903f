//! Operator-facing status log.
//!
//! Append-only progress and error text keyed by operation name, the way the
//! control panel's status box shows it. Every entry is also emitted as a
//! `tracing` event so the same text lands in the process log.
//!
//! Fatal conditions are written as a pair: a short header and the detailed
//! message (see [`StatusLog::fatal`]).

use crate::error::CamError;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

const MAX_STATUS_ENTRIES: usize = 1000;

/// Severity of a status entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    /// Progress.
    Info,
    /// Something was corrected or skipped.
    Warning,
    /// The operation failed.
    Error,
}

/// A single status entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// When the entry was written.
    pub timestamp: DateTime<Local>,
    /// Operation that produced it.
    pub operation: String,
    /// Severity.
    pub level: StatusLevel,
    /// Short header, present on fatal entries.
    pub header: Option<String>,
    /// Message text.
    pub message: String,
}

/// A thread-safe, fixed-capacity status log. Clones share the same entries.
#[derive(Clone)]
pub struct StatusLog(Arc<Mutex<VecDeque<StatusEntry>>>);

impl Default for StatusLog {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLog {
    /// Empty log.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_STATUS_ENTRIES,
        ))))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StatusEntry>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, operation: &str, level: StatusLevel, header: Option<&str>, message: String) {
        match level {
            StatusLevel::Info => info!(operation, "{message}"),
            StatusLevel::Warning => warn!(operation, "{message}"),
            StatusLevel::Error => error!(operation, header = header.unwrap_or(""), "{message}"),
        }

        let mut entries = self.lock();
        if entries.len() >= MAX_STATUS_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(StatusEntry {
            timestamp: Local::now(),
            operation: operation.to_string(),
            level,
            header: header.map(str::to_string),
            message,
        });
    }

    /// Record progress.
    pub fn info(&self, operation: &str, message: impl Into<String>) {
        self.push(operation, StatusLevel::Info, None, message.into());
    }

    /// Record a correction or a non-fatal problem.
    pub fn warn(&self, operation: &str, message: impl Into<String>) {
        self.push(operation, StatusLevel::Warning, None, message.into());
    }

    /// Record a fatal condition as a (header, detail) pair.
    pub fn fatal(&self, operation: &str, err: &CamError) {
        self.push(
            operation,
            StatusLevel::Error,
            Some(err.header()),
            err.to_string(),
        );
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<StatusEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Entries written by `operation`.
    pub fn for_operation(&self, operation: &str) -> Vec<StatusEntry> {
        self.lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    /// Fatal entries.
    pub fn errors(&self) -> Vec<StatusEntry> {
        self.lock()
            .iter()
            .filter(|e| e.level == StatusLevel::Error)
            .cloned()
            .collect()
    }

    /// True when any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|e| e.message.contains(needle))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::StatusCode;
    use tracing_test::traced_test;

    #[test]
    fn fatal_entries_carry_header_and_detail() {
        let log = StatusLog::new();
        log.info("arm", "Acquisition mode set.");
        log.fatal("start", &CamError::device("StartAcquisition", StatusCode::ERROR_ACK));

        let errors = log.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].header.as_deref(), Some("Camera error!"));
        assert!(errors[0].message.contains("Unable to communicate with card"));
        assert_eq!(log.for_operation("arm").len(), 1);
    }

    #[test]
    fn clones_share_entries() {
        let log = StatusLog::new();
        let other = log.clone();
        other.warn("validate", "dx 501 adjusted to 500");
        assert!(log.contains("adjusted"));
        log.clear();
        assert!(other.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let log = StatusLog::new();
        for i in 0..(MAX_STATUS_ENTRIES + 5) {
            log.info("poll", format!("tick {i}"));
        }
        assert_eq!(log.len(), MAX_STATUS_ENTRIES);
        assert_eq!(log.entries()[0].message, "tick 5");
    }

    #[test]
    #[traced_test]
    fn entries_are_mirrored_to_tracing() {
        let log = StatusLog::new();
        log.warn("validate", "emGain 4000 outside (1, 1000), using 1000");
        log.fatal("poll", &CamError::device("GetStatus", StatusCode::ERROR_ACK));

        assert!(logs_contain("emGain 4000 outside"));
        assert!(logs_contain("Error in acquisition loop."));
    }
}
