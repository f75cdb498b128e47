//! Error types for the tablet output adapter.

use std::time::Duration;

use snafu::prelude::*;

pub use tabletsink_core::ConfigError;

use crate::registry::TaskKey;
use crate::session::FlushFailure;

/// Errors reported by the storage client capability.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// The cluster could not be reached.
    #[snafu(display("Could not connect to master {master}: {message}"))]
    Connect { master: String, message: String },

    /// A network operation exceeded its deadline.
    #[snafu(display("Timed out after {timeout:?} while {operation}"))]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The requested table is not known to the cluster.
    #[snafu(display("Table '{table}' does not exist"))]
    TableNotFound { table: String },

    /// The connection was used after shutdown.
    #[snafu(display("Connection is shut down"))]
    ConnectionClosed,

    /// A whole batch failed without per-row attribution.
    #[snafu(display("Batch write failed: {message}"))]
    Transport { message: String },
}

/// Errors returned by a buffered session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
    /// The session no longer accepts mutations.
    #[snafu(display("Session is closed"))]
    Closed,

    /// Failures collected from background flushes since they were last reported.
    ///
    /// Each entry describes one flushed batch. The call that returns this
    /// error still had its own mutation accepted.
    #[snafu(display("{} flush failure(s) reported by the session", failures.len()))]
    Flush { failures: Vec<FlushFailure> },
}

/// Errors from the task registry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// Two outputs tried to register under one task key.
    #[snafu(display("Task key '{key}' is already registered"))]
    DuplicateRegistration { key: TaskKey },

    /// No live output is registered under the key.
    #[snafu(display("No output registered for task key '{key}'"))]
    NotRegistered { key: TaskKey },

    /// The registry reached its configured bound.
    #[snafu(display("Task registry is full ({capacity} entries)"))]
    RegistryFull { capacity: usize },
}

/// Errors from a record writer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WriterError {
    /// `write` was called after the writer or its session was closed.
    #[snafu(display("Record writer is closed"))]
    WriterClosed,

    /// `close` was called a second time.
    #[snafu(display("Record writer was already closed"))]
    AlreadyClosed,

    /// Failures that could not be attributed to rows were seen under the strict policy.
    #[snafu(display("{count} failure(s) could not be attributed to rows, last: {last}"))]
    UnclassifiedFailures { count: u64, last: String },
}

/// Top-level errors of the output adapter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OutputError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// The cluster could not be reached.
    #[snafu(display("Could not connect to masters '{master}': {source}"))]
    ConnectionFailed { master: String, source: ClientError },

    /// The output table could not be opened.
    #[snafu(display(
        "Could not open table '{table}' from masters '{master}' (is the master running and the table created?): {source}"
    ))]
    TableUnavailable {
        table: String,
        master: String,
        source: ClientError,
    },

    /// Registry error.
    #[snafu(display("Registry error: {source}"))]
    Registry { source: RegistryError },

    /// Writers were requested after the session handle was torn down.
    #[snafu(display("Output session was already torn down"))]
    SessionTornDown,

    /// Shutting the connection down failed.
    #[snafu(display("Failed to shut down connection: {source}"))]
    Teardown { source: ClientError },
}

impl OutputError {
    /// Returns true for errors that must abort the job rather than the task.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OutputError::Config { .. }
                | OutputError::ConnectionFailed { .. }
                | OutputError::TableUnavailable { .. }
        )
    }
}

impl From<ConfigError> for OutputError {
    fn from(source: ConfigError) -> Self {
        OutputError::Config { source }
    }
}

impl From<RegistryError> for OutputError {
    fn from(source: RegistryError) -> Self {
        OutputError::Registry { source }
    }
}
