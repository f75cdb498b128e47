//! Storage client capability.
//!
//! The adapter never talks to the network itself. It needs three things from
//! a client: connect to the masters, resolve a table, and write one batch of
//! mutations while reporting which rows were rejected. `Connector` and
//! `Connection` describe exactly that; `memory` provides an in-process
//! cluster implementing them.

pub mod memory;
mod operation;
mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use operation::{Operation, OperationKind, Row};
pub use status::{RowError, Status, StatusCode};

use crate::error::{ClientError, TimeoutSnafu};

/// Reference-counted handle to a [`Connection`].
pub type ConnectionRef = Arc<dyn Connection>;

/// Resolved table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    name: String,
    id: String,
    key_columns: Vec<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>, key_columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            key_columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Primary key columns, in key order.
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn new_insert(&self) -> Operation {
        Operation::new(OperationKind::Insert, &self.name)
    }

    pub fn new_update(&self) -> Operation {
        Operation::new(OperationKind::Update, &self.name)
    }

    pub fn new_upsert(&self) -> Operation {
        Operation::new(OperationKind::Upsert, &self.name)
    }

    pub fn new_delete(&self) -> Operation {
        Operation::new(OperationKind::Delete, &self.name)
    }
}

/// Factory for connections to a cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the cluster through the given comma-separated master addresses.
    async fn connect(
        &self,
        master_addresses: &str,
        timeout: Duration,
    ) -> Result<ConnectionRef, ClientError>;
}

/// A live connection to a cluster.
///
/// Implementations need not support concurrent batch writes from several
/// sessions; the adapter drives each connection from a single session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolve table metadata by name.
    async fn open_table(&self, name: &str) -> Result<TableRef, ClientError>;

    /// Write one batch.
    ///
    /// Returns the rows that were rejected; an empty vector means every row
    /// was applied. `Err` means the batch failed as a whole and the outcome of
    /// individual rows is unknown.
    async fn write_batch(
        &self,
        table: &TableRef,
        batch: &[Operation],
    ) -> Result<Vec<RowError>, ClientError>;

    /// Release network resources. Further calls fail with `ConnectionClosed`.
    async fn shutdown(&self) -> Result<(), ClientError>;

    fn is_closed(&self) -> bool;
}

/// Run a client call under a deadline, mapping expiry to [`ClientError::Timeout`].
pub async fn with_deadline<T, F>(
    timeout: Duration,
    operation: &str,
    future: F,
) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => TimeoutSnafu { operation, timeout }.fail(),
    }
}
