//! Internal events for the mutation write path.
//!
//! Every metric carries a `table` label so several outputs in one process can
//! be told apart.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Record this event.
    fn emit(self);
}

/// Mutations accepted into a session buffer.
pub struct MutationsApplied {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for MutationsApplied {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Mutations applied");
        counter!("tabletsink_mutations_applied_total", "table" => self.table).increment(self.count);
    }
}

/// A buffered batch was written to the cluster (successfully or not).
pub struct BatchFlushed {
    pub rows: usize,
    pub duration: Duration,
    pub table: String,
}

impl InternalEvent for BatchFlushed {
    fn emit(self) {
        trace!(
            rows = self.rows,
            duration_ms = self.duration.as_millis(),
            table = %self.table,
            "Batch flushed"
        );
        counter!("tabletsink_batches_flushed_total", "table" => self.table.clone()).increment(1);
        histogram!("tabletsink_flush_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Current number of mutations held in a session buffer.
pub struct BufferedMutations {
    pub count: usize,
    pub table: String,
}

impl InternalEvent for BufferedMutations {
    fn emit(self) {
        gauge!("tabletsink_buffered_mutations", "table" => self.table).set(self.count as f64);
    }
}

/// Row failures counted against a writer.
pub struct RowErrorsCounted {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RowErrorsCounted {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Row errors counted");
        counter!("tabletsink_rows_with_errors_total", "table" => self.table).increment(self.count);
    }
}

/// Row failures discarded as already applied after a leadership change.
pub struct BenignRowErrorsDiscarded {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for BenignRowErrorsDiscarded {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Benign row errors discarded");
        counter!("tabletsink_benign_row_errors_total", "table" => self.table).increment(self.count);
    }
}

/// A failure that could not be attributed to specific rows.
pub struct UnclassifiedFailure {
    pub table: String,
}

impl InternalEvent for UnclassifiedFailure {
    fn emit(self) {
        trace!(table = %self.table, "Unclassified failure");
        counter!("tabletsink_unclassified_failures_total", "table" => self.table).increment(1);
    }
}
