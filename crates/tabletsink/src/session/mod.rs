//! Buffered, background-flushed write session.
//!
//! # Buffering and backpressure
//!
//! A session holds at most `buffer_capacity` mutations that have been applied
//! but not yet written. Each `apply` takes one slot from a semaphore and the
//! slot travels with the mutation into the flush task; it is released only
//! after the batch containing the mutation has been written and its outcome
//! recorded. When every slot is taken, `apply` waits. Memory stays bounded
//! under high write rates and no mutation is ever dropped to make room.
//!
//! # Failure reporting
//!
//! Batch outcomes are discovered by the flush task, not by the caller that
//! applied the rows. They are queued as [`FlushFailure`]s and handed to
//! whichever call comes next (`apply`, `flush` or `close`) as a single
//! grouped [`SessionError::Flush`].
//!
//! # Shutdown
//!
//! `close` is the drain barrier: it asks the flush task to stop accepting
//! mutations, write everything it holds, and exit. Once `close` returns, no
//! outcome remains undiscovered.

mod flush;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use snafu::prelude::*;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tabletsink_core::emit;
use tabletsink_core::metrics::events::MutationsApplied;

use crate::client::{ConnectionRef, Operation, RowError, TableRef};
use crate::error::{ClosedSnafu, FlushSnafu, SessionError};

use flush::{Command, Flusher};

/// Largest buffer a session accepts; larger requests are clamped.
pub const MAX_BUFFER_CAPACITY: usize = 1 << 20;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// When buffered mutations are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// `apply` returns once the mutation is buffered; the flush task writes
    /// when the buffer fills or the flush interval elapses.
    #[default]
    AutoFlushBackground,
    /// `apply` returns once the batch holding the mutation has been written.
    AutoFlushSync,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deadline for each batch write.
    pub timeout: Duration,
    pub flush_mode: FlushMode,
    /// Maximum mutations buffered before `apply` waits.
    pub buffer_capacity: usize,
    /// Background flush timer.
    pub flush_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            flush_mode: FlushMode::default(),
            buffer_capacity: 1000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of one flushed batch that did not fully succeed.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushFailure {
    /// Rows rejected by the cluster, with their statuses.
    RowErrors(Vec<RowError>),
    /// The batch failed as a whole; individual rows cannot be blamed.
    Unclassified { cause: String },
}

impl FlushFailure {
    /// Rows this failure accounts for, zero when unattributed.
    pub fn row_count(&self) -> usize {
        match self {
            FlushFailure::RowErrors(errors) => errors.len(),
            FlushFailure::Unclassified { .. } => 0,
        }
    }
}

/// A buffered mutation channel to one table.
pub struct Session {
    commands: mpsc::Sender<Command>,
    permits: Arc<Semaphore>,
    failures: Arc<Mutex<Vec<FlushFailure>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    flush_mode: FlushMode,
    capacity: usize,
    table: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("table", &self.table)
            .field("capacity", &self.capacity)
            .field("flush_mode", &self.flush_mode)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session and its flush task on the current tokio runtime.
    pub fn spawn(connection: ConnectionRef, table: Arc<TableRef>, options: SessionOptions) -> Self {
        let capacity = options.buffer_capacity.clamp(1, MAX_BUFFER_CAPACITY);
        let flush_interval = options.flush_interval.max(Duration::from_millis(1));
        let table_name = table.name().to_string();

        let (command_tx, command_rx) = mpsc::channel(capacity + 1);
        let failures = Arc::new(Mutex::new(Vec::new()));

        let flusher = Flusher::new(
            connection,
            table,
            options.timeout,
            capacity,
            Arc::clone(&failures),
        );
        let task = tokio::spawn(flusher.run(command_rx, flush_interval));

        debug!(
            table = %table_name,
            capacity,
            flush_interval_ms = flush_interval.as_millis(),
            "Started session"
        );

        Self {
            commands: command_tx,
            permits: Arc::new(Semaphore::new(capacity)),
            failures,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            flush_mode: options.flush_mode,
            capacity,
            table: table_name,
        }
    }

    /// Buffer one mutation, waiting for a free slot if the buffer is full.
    ///
    /// Returns failures from earlier flushes, if any were pending; the
    /// mutation passed to this call is accepted either way.
    pub async fn apply(&self, operation: Operation) -> Result<(), SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ClosedSnafu.build())?;
        self.commands
            .send(Command::Apply { operation, permit })
            .await
            .map_err(|_| ClosedSnafu.build())?;

        emit!(MutationsApplied {
            count: 1,
            table: self.table.clone(),
        });

        if self.flush_mode == FlushMode::AutoFlushSync {
            return self.flush().await;
        }
        self.take_failures()
    }

    /// Write everything buffered now and report pending failures.
    pub async fn flush(&self) -> Result<(), SessionError> {
        ensure!(!self.is_closed(), ClosedSnafu);

        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Flush(ack))
            .await
            .map_err(|_| ClosedSnafu.build())?;
        done.await.map_err(|_| ClosedSnafu.build())?;

        self.take_failures()
    }

    /// Drain all buffered mutations, stop the flush task and report every
    /// remaining failure.
    ///
    /// Only the first call drains; later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_ok() {
            let _ = done.await;
        }

        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(table = %self.table, error = %e, "Flush task ended abnormally");
            lock(&self.failures).push(FlushFailure::Unclassified {
                cause: format!("flush task ended abnormally: {e}"),
            });
        }

        self.permits.close();
        debug!(table = %self.table, "Closed session");

        self.take_failures()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mutations applied but not yet written.
    pub fn buffered(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Detach the flush task so it can be awaited elsewhere.
    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.task).take()
    }

    /// Failures recorded by the flush task and not yet reported.
    pub fn pending_failures(&self) -> usize {
        lock(&self.failures).len()
    }

    fn take_failures(&self) -> Result<(), SessionError> {
        let failures = std::mem::take(&mut *lock(&self.failures));
        if failures.is_empty() {
            return Ok(());
        }
        FlushSnafu { failures }.fail()
    }
}
