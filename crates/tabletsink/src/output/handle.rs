//! Connection, table and session owned by one output.
//!
//! A handle is expected to be torn down explicitly, by validation or by a
//! writer's close. A handle dropped without teardown still drains its
//! session and shuts the connection down in the background, but the outcome
//! of that drain is only logged.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use snafu::prelude::*;
use tracing::{info, warn};

use crate::client::{ConnectionRef, Connector, TableRef, with_deadline};
use crate::config::OutputConfig;
use crate::error::{ClientError, ConnectionFailedSnafu, OutputError, SessionError};
use crate::session::Session;

/// Results of the one teardown a handle performs.
#[derive(Debug)]
pub struct TeardownOutcome {
    /// Outcome of draining the session.
    pub drain: Result<(), SessionError>,
    /// Outcome of shutting the connection down.
    pub shutdown: Result<(), ClientError>,
}

pub struct SessionHandle {
    connection: ConnectionRef,
    table: Arc<TableRef>,
    session: Session,
    torn_down: AtomicBool,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("table", &self.table.name())
            .field("session", &self.session)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Connect, resolve the table and start a session.
    ///
    /// The connection is shut down again if the table cannot be opened.
    pub async fn open(connector: &dyn Connector, config: &OutputConfig) -> Result<Self, OutputError> {
        config.validate()?;
        let timeout = config.operation_timeout();
        let master = config.master_addresses.as_str();

        let connection = with_deadline(
            timeout,
            "connecting to masters",
            connector.connect(master, timeout),
        )
        .await
        .context(ConnectionFailedSnafu { master })?;

        let table = match with_deadline(
            timeout,
            "opening table",
            connection.open_table(&config.table),
        )
        .await
        {
            Ok(table) => Arc::new(table),
            Err(source) => {
                if let Err(e) = connection.shutdown().await {
                    warn!(master, error = %e, "Failed to shut down connection after open failure");
                }
                return Err(OutputError::TableUnavailable {
                    table: config.table.clone(),
                    master: master.to_string(),
                    source,
                });
            }
        };

        let session = Session::spawn(
            Arc::clone(&connection),
            Arc::clone(&table),
            config.session_options(),
        );

        info!(
            table = %table.name(),
            table_id = %table.id(),
            master,
            buffer_rows = config.buffer_row_count,
            "Opened output session"
        );

        Ok(Self {
            connection,
            table,
            session,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn table(&self) -> &Arc<TableRef> {
        &self.table
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Drain the session, then shut the connection down.
    ///
    /// Only the first call does any work; later calls return `None`.
    pub async fn teardown(&self) -> Option<TeardownOutcome> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return None;
        }

        let drain = self.session.close().await;
        let shutdown = self.connection.shutdown().await;

        info!(
            table = %self.table.name(),
            drained = drain.is_ok(),
            "Tore down output session"
        );
        Some(TeardownOutcome { drain, shutdown })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.is_torn_down() {
            return;
        }
        let table = self.table.name().to_string();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(table = %table, "Output dropped outside a runtime, connection left open");
            return;
        };

        warn!(table = %table, "Output dropped without teardown, shutting down in the background");
        // The flush task drains and exits once the session's sender is
        // dropped with this handle; shut down only after that.
        let task = self.session.take_task();
        let connection = Arc::clone(&self.connection);
        runtime.spawn(async move {
            if let Some(task) = task
                && let Err(e) = task.await
            {
                warn!(table = %table, error = %e, "Flush task ended abnormally");
            }
            if let Err(e) = connection.shutdown().await {
                warn!(table = %table, error = %e, "Failed to shut down connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryCluster;

    #[tokio::test]
    async fn test_open_and_teardown_once() {
        let cluster = MemoryCluster::new();
        cluster.create_table("events", &["id"]);
        let config = OutputConfig::new("events", "master-1:7051");

        let handle = SessionHandle::open(&cluster, &config).await.unwrap();
        assert_eq!(cluster.open_connections(), 1);

        let outcome = handle.teardown().await.unwrap();
        assert!(outcome.drain.is_ok());
        assert!(outcome.shutdown.is_ok());
        assert_eq!(cluster.open_connections(), 0);

        assert!(handle.teardown().await.is_none());
        assert!(handle.is_torn_down());
    }

    #[tokio::test]
    async fn test_missing_table_releases_connection() {
        let cluster = MemoryCluster::new();
        let config = OutputConfig::new("missing", "master-1:7051");

        let err = SessionHandle::open(&cluster, &config).await.unwrap_err();
        assert!(matches!(err, OutputError::TableUnavailable { .. }));
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("master-1:7051"));
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_oversized_buffer_rejected_before_connecting() {
        let cluster = MemoryCluster::new();
        cluster.create_table("events", &["id"]);
        let config = OutputConfig::new("events", "master-1:7051").with_buffer_row_count(1 << 62);

        let err = SessionHandle::open(&cluster, &config).await.unwrap_err();
        assert!(matches!(err, OutputError::Config { .. }));
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_teardown_releases_connection() {
        let cluster = MemoryCluster::new();
        cluster.create_table("events", &["id"]);
        let config = OutputConfig::new("events", "master-1:7051")
            .with_flush_interval(std::time::Duration::from_secs(60));

        let handle = SessionHandle::open(&cluster, &config).await.unwrap();
        let table = Arc::clone(handle.table());
        handle
            .session()
            .apply(table.new_insert().with("id", 1))
            .await
            .unwrap();
        drop(handle);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while cluster.open_connections() > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dropped handle should shut its connection down");
        assert_eq!(cluster.row_count("events"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_cluster() {
        let cluster = MemoryCluster::new();
        cluster.set_available(false);
        let config = OutputConfig::new("events", "master-1:7051");

        let err = SessionHandle::open(&cluster, &config).await.unwrap_err();
        assert!(matches!(err, OutputError::ConnectionFailed { .. }));
        assert!(err.is_fatal());
    }
}
