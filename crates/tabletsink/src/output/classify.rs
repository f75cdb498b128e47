//! Flush failure classification.
//!
//! After a leadership change the new leader may reject a retried insert with
//! `AlreadyPresent` even though the row was applied. A batch whose every
//! error is of that kind is therefore benign and not counted against the task.

use crate::client::Status;
use crate::session::FlushFailure;

/// How a flush failure affects the error count.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Only already-applied rows; nothing to count.
    Benign { rows: usize },
    /// Real row failures. `first` is the first status, kept for logging.
    Rows { count: usize, first: Status },
    /// The batch failed as a whole.
    Unclassified { cause: String },
}

pub fn classify(failure: &FlushFailure) -> Classification {
    match failure {
        FlushFailure::RowErrors(errors) => {
            if errors.iter().all(|e| e.is_already_present()) {
                return Classification::Benign { rows: errors.len() };
            }
            // Non-empty here: an empty list is vacuously benign.
            let first = errors[0].status.clone();
            Classification::Rows {
                count: errors.len(),
                first,
            }
        }
        FlushFailure::Unclassified { cause } => Classification::Unclassified {
            cause: cause.clone(),
        },
    }
}

/// Per-writer failure counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounter {
    pub rows_with_errors: u64,
    pub unclassified: u64,
}

impl ErrorCounter {
    pub fn record(&mut self, classification: &Classification) {
        match classification {
            Classification::Benign { .. } => {}
            Classification::Rows { count, .. } => self.rows_with_errors += *count as u64,
            Classification::Unclassified { .. } => self.unclassified += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Operation, OperationKind, RowError, StatusCode};

    fn row_error(code: StatusCode) -> RowError {
        RowError::new(
            Status::new(code, "rejected"),
            Operation::new(OperationKind::Insert, "events").with("id", 1),
        )
    }

    #[test]
    fn test_all_already_present_is_benign() {
        let failure = FlushFailure::RowErrors(vec![
            row_error(StatusCode::AlreadyPresent),
            row_error(StatusCode::AlreadyPresent),
        ]);
        assert_eq!(classify(&failure), Classification::Benign { rows: 2 });
    }

    #[test]
    fn test_mixed_batch_counts_every_row() {
        let failure = FlushFailure::RowErrors(vec![
            row_error(StatusCode::AlreadyPresent),
            row_error(StatusCode::NotFound),
            row_error(StatusCode::InvalidArgument),
        ]);
        let Classification::Rows { count, first } = classify(&failure) else {
            panic!("expected counted rows");
        };
        assert_eq!(count, 3);
        assert_eq!(first.code, StatusCode::AlreadyPresent);
    }

    #[test]
    fn test_empty_row_errors_are_benign() {
        let failure = FlushFailure::RowErrors(Vec::new());
        assert_eq!(classify(&failure), Classification::Benign { rows: 0 });
    }

    #[test]
    fn test_unclassified_is_not_counted_as_rows() {
        let mut counter = ErrorCounter::default();
        let classification = classify(&FlushFailure::Unclassified {
            cause: "socket closed".into(),
        });
        counter.record(&classification);

        assert_eq!(counter.rows_with_errors, 0);
        assert_eq!(counter.unclassified, 1);
    }

    #[test]
    fn test_counter_accumulates() {
        let mut counter = ErrorCounter::default();
        counter.record(&classify(&FlushFailure::RowErrors(vec![row_error(
            StatusCode::NotFound,
        )])));
        counter.record(&classify(&FlushFailure::RowErrors(vec![
            row_error(StatusCode::TimedOut),
            row_error(StatusCode::TimedOut),
        ])));
        counter.record(&classify(&FlushFailure::RowErrors(vec![row_error(
            StatusCode::AlreadyPresent,
        )])));
        assert_eq!(counter.rows_with_errors, 3);
    }
}
