//! Per-row outcome reporting.

use std::fmt;

use super::Operation;

/// Outcome category reported by a tablet server for a rejected row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The row already exists. After a leader change this means the write
    /// was applied by the new leader before the retry reached it.
    AlreadyPresent,
    NotFound,
    InvalidArgument,
    TimedOut,
    ServiceUnavailable,
    IllegalState,
    RuntimeError,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::AlreadyPresent => "already_present",
            StatusCode::NotFound => "not_found",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::TimedOut => "timed_out",
            StatusCode::ServiceUnavailable => "service_unavailable",
            StatusCode::IllegalState => "illegal_state",
            StatusCode::RuntimeError => "runtime_error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status code plus a server-provided message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A rejected row and the reason it was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub status: Status,
    pub operation: Operation,
}

impl RowError {
    pub fn new(status: Status, operation: Operation) -> Self {
        Self { status, operation }
    }

    /// True for the stale-leader / already-applied category.
    pub fn is_already_present(&self) -> bool {
        self.status.code == StatusCode::AlreadyPresent
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} rejected: {}",
            self.operation.kind.as_str(),
            self.operation.table,
            self.status
        )
    }
}
