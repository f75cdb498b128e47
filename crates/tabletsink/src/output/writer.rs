//! Record writer forwarding operations into the shared session.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use tabletsink_core::emit;
use tabletsink_core::metrics::events::{
    BenignRowErrorsDiscarded, RowErrorsCounted, UnclassifiedFailure,
};

use super::classify::{Classification, ErrorCounter, classify};
use super::{OutputCounter, OutputShared};
use crate::client::Operation;
use crate::config::UnclassifiedPolicy;
use crate::error::{
    AlreadyClosedSnafu, SessionError, UnclassifiedFailuresSnafu, WriterClosedSnafu, WriterError,
};
use crate::framework::{RecordWriter, TaskAttemptContext};
use crate::session::FlushFailure;

/// Writes one task's operations. Keys are ignored.
///
/// Failures surface asynchronously: a `write` may report the outcome of
/// batches applied by earlier calls, and `close` reports whatever the final
/// drain finds. Row failures end up in the error counter; only unclassified
/// failures under the strict policy fail a call.
pub struct TableRecordWriter {
    shared: Arc<OutputShared>,
    counter: ErrorCounter,
    last_unclassified: Option<String>,
    closed: bool,
}

impl std::fmt::Debug for TableRecordWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRecordWriter")
            .field("counter", &self.counter)
            .field("last_unclassified", &self.last_unclassified)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl TableRecordWriter {
    pub(super) fn new(shared: Arc<OutputShared>) -> Self {
        Self {
            shared,
            counter: ErrorCounter::default(),
            last_unclassified: None,
            closed: false,
        }
    }

    /// Counts seen so far.
    pub fn error_count(&self) -> ErrorCounter {
        self.counter
    }

    /// Buffer one operation, waiting while the session buffer is full.
    pub async fn write(&mut self, operation: Operation) -> Result<(), WriterError> {
        ensure!(!self.closed, WriterClosedSnafu);

        match self.shared.handle.session().apply(operation).await {
            Ok(()) => Ok(()),
            Err(SessionError::Closed) => WriterClosedSnafu.fail(),
            Err(SessionError::Flush { failures }) => {
                let unclassified = self.absorb(failures);
                self.check_policy(unclassified)
            }
        }
    }

    /// Drain outstanding operations, tear the output down and publish counters.
    pub async fn close(&mut self, ctx: Option<&TaskAttemptContext>) -> Result<(), WriterError> {
        ensure!(!self.closed, AlreadyClosedSnafu);
        self.closed = true;

        if let Some(outcome) = self.shared.teardown().await {
            if let Err(SessionError::Flush { failures }) = outcome.drain {
                self.absorb(failures);
            }
            if let Err(e) = outcome.shutdown {
                self.absorb(vec![FlushFailure::Unclassified {
                    cause: format!("connection shutdown failed: {e}"),
                }]);
            }
        }

        if let Some(ctx) = ctx {
            ctx.counters.set(
                OutputCounter::RowsWithErrors.as_str(),
                self.counter.rows_with_errors,
            );
            ctx.counters.set(
                OutputCounter::UnclassifiedFailures.as_str(),
                self.counter.unclassified,
            );
        }

        info!(
            table = %self.table_name(),
            rows_with_errors = self.counter.rows_with_errors,
            unclassified = self.counter.unclassified,
            "Closed record writer"
        );

        self.check_policy(self.counter.unclassified)
    }

    /// Classify and count failures, returning how many were unclassified.
    fn absorb(&mut self, failures: Vec<FlushFailure>) -> u64 {
        let table = self.table_name().to_string();
        let mut unclassified = 0;

        for failure in &failures {
            let classification = classify(failure);
            match &classification {
                Classification::Benign { rows } => {
                    debug!(table = %table, rows, "Ignoring rows already applied by a previous leader");
                    emit!(BenignRowErrorsDiscarded {
                        count: *rows as u64,
                        table: table.clone(),
                    });
                }
                Classification::Rows { count, first } => {
                    warn!(table = %table, rows = count, first_error = %first, "Rows failed to apply");
                    emit!(RowErrorsCounted {
                        count: *count as u64,
                        table: table.clone(),
                    });
                }
                Classification::Unclassified { cause } => {
                    warn!(table = %table, cause = %cause, "Failure could not be attributed to rows");
                    emit!(UnclassifiedFailure {
                        table: table.clone(),
                    });
                    self.last_unclassified = Some(cause.clone());
                    unclassified += 1;
                }
            }
            self.counter.record(&classification);
        }

        unclassified
    }

    fn check_policy(&self, unclassified: u64) -> Result<(), WriterError> {
        if unclassified == 0 || self.shared.config.unclassified_policy == UnclassifiedPolicy::Lenient
        {
            return Ok(());
        }
        UnclassifiedFailuresSnafu {
            count: self.counter.unclassified,
            last: self.last_unclassified.clone().unwrap_or_default(),
        }
        .fail()
    }

    fn table_name(&self) -> &str {
        self.shared.handle.table().name()
    }
}

#[async_trait]
impl RecordWriter<(), Operation> for TableRecordWriter {
    type Error = WriterError;

    async fn write(&mut self, _key: (), value: Operation) -> Result<(), WriterError> {
        TableRecordWriter::write(self, value).await
    }

    async fn close(&mut self, ctx: Option<&TaskAttemptContext>) -> Result<(), WriterError> {
        TableRecordWriter::close(self, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::TabletOutputFormat;
    use crate::client::StatusCode;
    use crate::client::memory::MemoryCluster;
    use crate::config::OutputConfig;
    use crate::output::TaskScope;
    use crate::registry::{TaskKey, TaskRegistry};
    use tabletsink_core::JobConf;

    async fn format(cluster: &MemoryCluster, config: OutputConfig) -> TabletOutputFormat {
        cluster.create_table("events", &["id"]);
        let mut conf = JobConf::new();
        config.write_to(&mut conf);
        let scope = TaskScope::new(Arc::new(TaskRegistry::new()), TaskKey::new("writer-test"));
        TabletOutputFormat::configure_with(&mut conf, cluster, scope)
            .await
            .unwrap()
    }

    fn task() -> TaskAttemptContext {
        TaskAttemptContext::new("attempt_1", JobConf::new())
    }

    #[tokio::test]
    async fn test_clean_run_counts_nothing() {
        let cluster = MemoryCluster::new();
        let format = format(&cluster, OutputConfig::new("events", "m:7051")).await;
        let ctx = task();
        let mut writer = format.record_writer(&ctx).unwrap();
        let table = format.table();

        for id in 0..50 {
            writer.write(table.new_insert().with("id", id)).await.unwrap();
        }
        writer.close(Some(&ctx)).await.unwrap();

        assert_eq!(cluster.row_count("events"), 50);
        assert_eq!(ctx.counters.get("ROWS_WITH_ERRORS"), Some(0));
        assert_eq!(writer.error_count(), ErrorCounter::default());
    }

    #[tokio::test]
    async fn test_duplicate_inserts_are_benign() {
        let cluster = MemoryCluster::new();
        let format = format(
            &cluster,
            OutputConfig::new("events", "m:7051").with_buffer_row_count(2),
        )
        .await;
        let ctx = task();
        let mut writer = format.record_writer(&ctx).unwrap();
        let table = format.table();

        for _ in 0..2 {
            for id in 0..4 {
                writer.write(table.new_insert().with("id", id)).await.unwrap();
            }
        }
        writer.close(Some(&ctx)).await.unwrap();

        assert_eq!(ctx.counters.get("ROWS_WITH_ERRORS"), Some(0));
        assert_eq!(cluster.row_count("events"), 4);
    }

    #[tokio::test]
    async fn test_strict_policy_fails_close() {
        let cluster = MemoryCluster::new();
        let format = format(&cluster, OutputConfig::new("events", "m:7051")).await;
        let ctx = task();
        let mut writer = format.record_writer(&ctx).unwrap();

        cluster.fail_next_batch("tablet server unreachable");
        writer
            .write(format.table().new_upsert().with("id", 1))
            .await
            .unwrap();

        let err = writer.close(Some(&ctx)).await.unwrap_err();
        assert!(matches!(err, WriterError::UnclassifiedFailures { count: 1, .. }));
        assert_eq!(ctx.counters.get("UNCLASSIFIED_FAILURES"), Some(1));
        assert_eq!(ctx.counters.get("ROWS_WITH_ERRORS"), Some(0));
    }

    #[tokio::test]
    async fn test_lenient_policy_only_counts() {
        let cluster = MemoryCluster::new();
        let config = OutputConfig::new("events", "m:7051")
            .with_unclassified_policy(UnclassifiedPolicy::Lenient);
        let format = format(&cluster, config).await;
        let ctx = task();
        let mut writer = format.record_writer(&ctx).unwrap();

        cluster.fail_next_batch("tablet server unreachable");
        writer
            .write(format.table().new_upsert().with("id", 1))
            .await
            .unwrap();

        writer.close(Some(&ctx)).await.unwrap();
        assert_eq!(writer.error_count().unclassified, 1);
    }

    #[tokio::test]
    async fn test_strict_policy_fails_next_write() {
        let cluster = MemoryCluster::new();
        let config = OutputConfig::new("events", "m:7051").with_buffer_row_count(1);
        let format = format(&cluster, config).await;
        let mut writer = format.record_writer(&task()).unwrap();
        let table = format.table();

        cluster.fail_next_batch("leader lost");

        // The failed batch frees its slot only after recording the failure,
        // so the second write at the latest sees it.
        let err = match writer.write(table.new_upsert().with("id", 1)).await {
            Err(e) => e,
            Ok(()) => writer
                .write(table.new_upsert().with("id", 2))
                .await
                .unwrap_err(),
        };
        assert!(matches!(err, WriterError::UnclassifiedFailures { ref last, .. } if last.contains("leader lost")));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let cluster = MemoryCluster::new();
        let format = format(&cluster, OutputConfig::new("events", "m:7051")).await;
        let mut writer = format.record_writer(&task()).unwrap();

        writer.close(None).await.unwrap();
        assert!(matches!(
            writer.close(None).await,
            Err(WriterError::AlreadyClosed)
        ));
        assert!(matches!(
            writer.write(format.table().new_insert().with("id", 1)).await,
            Err(WriterError::WriterClosed)
        ));
    }

    #[tokio::test]
    async fn test_row_errors_reported_through_close() {
        let cluster = MemoryCluster::new();
        let format = format(
            &cluster,
            OutputConfig::new("events", "m:7051").with_flush_interval(Duration::from_secs(60)),
        )
        .await;
        cluster.inject_row_status("events", "3", StatusCode::InvalidArgument);
        let ctx = task();
        let mut writer = format.record_writer(&ctx).unwrap();

        for id in 0..5 {
            writer
                .write(format.table().new_upsert().with("id", id))
                .await
                .unwrap();
        }
        writer
            .write(format.table().new_update().with("id", 99))
            .await
            .unwrap();
        writer.close(Some(&ctx)).await.unwrap();

        assert_eq!(ctx.counters.get("ROWS_WITH_ERRORS"), Some(2));
    }
}
