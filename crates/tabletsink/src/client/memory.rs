//! In-process cluster implementing the client capability.
//!
//! Rows are keyed by their primary-key columns and the usual tablet server
//! rules apply: inserting an existing key reports `AlreadyPresent`, updating
//! or deleting a missing key reports `NotFound`, upserts always succeed.
//!
//! The cluster also exposes hooks for exercising failure paths: per-key
//! injected statuses, whole-batch failures, pausing writes, and counters for
//! open connections and batch sizes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use snafu::prelude::*;
use tokio::sync::watch;
use tracing::debug;

use super::{
    Connection, ConnectionRef, Connector, Operation, OperationKind, Row, RowError, Status,
    StatusCode, TableRef,
};
use crate::error::{
    ClientError, ConnectSnafu, ConnectionClosedSnafu, TableNotFoundSnafu, TransportSnafu,
};

struct MemoryTable {
    table: TableRef,
    rows: BTreeMap<String, Row>,
}

struct ClusterState {
    available: AtomicBool,
    tables: Mutex<HashMap<String, MemoryTable>>,
    injected: Mutex<HashMap<(String, String), StatusCode>>,
    failing_batches: Mutex<VecDeque<String>>,
    failing_shutdowns: Mutex<VecDeque<String>>,
    batch_sizes: Mutex<Vec<usize>>,
    paused: watch::Sender<bool>,
    open_connections: AtomicUsize,
    next_table_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory tablet cluster.
///
/// Cloning shares the same cluster.
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCluster")
            .field("open_connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(ClusterState {
                available: AtomicBool::new(true),
                tables: Mutex::new(HashMap::new()),
                injected: Mutex::new(HashMap::new()),
                failing_batches: Mutex::new(VecDeque::new()),
                failing_shutdowns: Mutex::new(VecDeque::new()),
                batch_sizes: Mutex::new(Vec::new()),
                paused,
                open_connections: AtomicUsize::new(0),
                next_table_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create (or replace) a table with the given primary key columns.
    pub fn create_table(&self, name: &str, key_columns: &[&str]) -> TableRef {
        let id = self.state.next_table_id.fetch_add(1, Ordering::Relaxed);
        let table = TableRef::new(
            name,
            format!("tablet-{id:08x}"),
            key_columns.iter().map(|c| c.to_string()).collect(),
        );
        lock(&self.state.tables).insert(
            name.to_string(),
            MemoryTable {
                table: table.clone(),
                rows: BTreeMap::new(),
            },
        );
        table
    }

    /// Make new connection attempts fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::Release);
    }

    /// Reject every write to the row with `key` (primary key values joined by `/`).
    pub fn inject_row_status(&self, table: &str, key: &str, code: StatusCode) {
        lock(&self.state.injected).insert((table.to_string(), key.to_string()), code);
    }

    pub fn clear_injected(&self) {
        lock(&self.state.injected).clear();
    }

    /// Fail the next batch as a whole, without row attribution.
    pub fn fail_next_batch(&self, message: impl Into<String>) {
        lock(&self.state.failing_batches).push_back(message.into());
    }

    /// Fail the next connection shutdown; the connection stays open.
    pub fn fail_next_shutdown(&self, message: impl Into<String>) {
        lock(&self.state.failing_shutdowns).push_back(message.into());
    }

    /// Hold every batch write until [`resume_writes`](Self::resume_writes).
    pub fn pause_writes(&self) {
        self.state.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.state.paused.send_replace(false);
    }

    /// Connections opened and not yet shut down.
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::Acquire)
    }

    /// Sizes of every batch received so far, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.state.batch_sizes).clone()
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state.tables)
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub fn get_row(&self, table: &str, key: &str) -> Option<Row> {
        lock(&self.state.tables)
            .get(table)
            .and_then(|t| t.rows.get(key).cloned())
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(
        &self,
        master_addresses: &str,
        _timeout: Duration,
    ) -> Result<ConnectionRef, ClientError> {
        ensure!(
            !master_addresses.trim().is_empty(),
            ConnectSnafu {
                master: master_addresses,
                message: "no master addresses given",
            }
        );
        ensure!(
            self.state.available.load(Ordering::Acquire),
            ConnectSnafu {
                master: master_addresses,
                message: "cluster unavailable",
            }
        );

        self.state.open_connections.fetch_add(1, Ordering::AcqRel);
        debug!(master = master_addresses, "Opened in-memory connection");

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to a [`MemoryCluster`].
pub struct MemoryConnection {
    state: Arc<ClusterState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), ClientError> {
        ensure!(!self.is_closed(), ConnectionClosedSnafu);
        Ok(())
    }

    async fn wait_while_paused(&self) {
        let mut paused = self.state.paused.subscribe();
        // The sender lives as long as the cluster state we hold.
        let _ = paused.wait_for(|p| !*p).await;
    }
}

/// Encode the primary key of `row`, or explain why it cannot be encoded.
fn encode_key(table: &TableRef, row: &Row) -> Result<String, String> {
    let mut parts = Vec::with_capacity(table.key_columns().len());
    for column in table.key_columns() {
        match row.get(column) {
            None | Some(Value::Null) => return Err(format!("missing key column '{column}'")),
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(other) => parts.push(other.to_string()),
        }
    }
    Ok(parts.join("/"))
}

fn apply_row(
    rows: &mut BTreeMap<String, Row>,
    key: String,
    operation: &Operation,
) -> Result<(), Status> {
    match operation.kind {
        OperationKind::Insert => {
            if rows.contains_key(&key) {
                return Err(Status::new(
                    StatusCode::AlreadyPresent,
                    format!("key already present: {key}"),
                ));
            }
            rows.insert(key, operation.row.clone());
        }
        OperationKind::Upsert => {
            rows.insert(key, operation.row.clone());
        }
        OperationKind::Update => {
            let Some(existing) = rows.get_mut(&key) else {
                return Err(Status::new(
                    StatusCode::NotFound,
                    format!("key not found: {key}"),
                ));
            };
            for (column, value) in &operation.row {
                existing.insert(column.clone(), value.clone());
            }
        }
        OperationKind::Delete => {
            if rows.remove(&key).is_none() {
                return Err(Status::new(
                    StatusCode::NotFound,
                    format!("key not found: {key}"),
                ));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_table(&self, name: &str) -> Result<TableRef, ClientError> {
        self.ensure_open()?;
        lock(&self.state.tables)
            .get(name)
            .map(|t| t.table.clone())
            .context(TableNotFoundSnafu { table: name })
    }

    async fn write_batch(
        &self,
        table: &TableRef,
        batch: &[Operation],
    ) -> Result<Vec<RowError>, ClientError> {
        self.ensure_open()?;
        self.wait_while_paused().await;
        self.ensure_open()?;

        lock(&self.state.batch_sizes).push(batch.len());

        if let Some(message) = lock(&self.state.failing_batches).pop_front() {
            return TransportSnafu { message }.fail();
        }

        let injected = lock(&self.state.injected).clone();
        let mut tables = lock(&self.state.tables);
        let stored = tables.get_mut(table.name()).context(TableNotFoundSnafu {
            table: table.name(),
        })?;

        let mut errors = Vec::new();
        for operation in batch {
            let outcome = match encode_key(&stored.table, &operation.row) {
                Err(reason) => Err(Status::new(StatusCode::InvalidArgument, reason)),
                Ok(key) => match injected.get(&(table.name().to_string(), key.clone())) {
                    Some(code) => Err(Status::new(*code, format!("injected failure for {key}"))),
                    None => apply_row(&mut stored.rows, key, operation),
                },
            };
            if let Err(status) = outcome {
                errors.push(RowError::new(status, operation.clone()));
            }
        }

        Ok(errors)
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        if !self.is_closed()
            && let Some(message) = lock(&self.state.failing_shutdowns).pop_front()
        {
            return TransportSnafu { message }.fail();
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.open_connections.fetch_sub(1, Ordering::AcqRel);
            debug!("Shut down in-memory connection");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(cluster: &MemoryCluster) -> ConnectionRef {
        cluster
            .connect("master-1:7051", Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_semantics() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table("events", &["id"]);
        let conn = connect(&cluster).await;

        let batch = vec![
            table.new_insert().with("id", 1).with("v", "a"),
            table.new_insert().with("id", 1).with("v", "b"),
            table.new_update().with("id", 2).with("v", "c"),
            table.new_upsert().with("id", 3).with("v", "d"),
            table.new_delete().with("id", 4),
            table.new_insert().with("v", "no key"),
        ];
        let errors = conn.write_batch(&table, &batch).await.unwrap();

        let codes: Vec<_> = errors.iter().map(|e| e.status.code).collect();
        assert_eq!(
            codes,
            [
                StatusCode::AlreadyPresent,
                StatusCode::NotFound,
                StatusCode::NotFound,
                StatusCode::InvalidArgument,
            ]
        );
        assert_eq!(cluster.row_count("events"), 2);
        assert_eq!(cluster.get_row("events", "1").unwrap()["v"], "a");
        assert_eq!(cluster.batch_sizes(), [6]);
    }

    #[tokio::test]
    async fn test_composite_key_and_injection() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table("metrics", &["host", "ts"]);
        cluster.inject_row_status("metrics", "web-1/100", StatusCode::ServiceUnavailable);
        let conn = connect(&cluster).await;

        let batch = vec![
            table.new_insert().with("host", "web-1").with("ts", 100),
            table.new_insert().with("host", "web-1").with("ts", 101),
        ];
        let errors = conn.write_batch(&table, &batch).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status.code, StatusCode::ServiceUnavailable);
        assert!(cluster.get_row("metrics", "web-1/101").is_some());
    }

    #[tokio::test]
    async fn test_failed_batch_and_closed_connection() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table("events", &["id"]);
        let conn = connect(&cluster).await;
        assert_eq!(cluster.open_connections(), 1);

        cluster.fail_next_batch("tablet server unreachable");
        let err = conn
            .write_batch(&table, &[table.new_upsert().with("id", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));

        conn.shutdown().await.unwrap();
        conn.shutdown().await.unwrap();
        assert_eq!(cluster.open_connections(), 0);
        assert!(matches!(
            conn.open_table("events").await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_and_open_failures() {
        let cluster = MemoryCluster::new();
        let conn = connect(&cluster).await;
        assert!(matches!(
            conn.open_table("missing").await,
            Err(ClientError::TableNotFound { .. })
        ));

        cluster.set_available(false);
        let err = cluster
            .connect("master-1:7051", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
