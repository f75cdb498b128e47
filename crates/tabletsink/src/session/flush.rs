//! Background flush task.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use tabletsink_core::emit;
use tabletsink_core::metrics::events::{BatchFlushed, BufferedMutations};

use super::{FlushFailure, lock};
use crate::client::{ConnectionRef, Operation, RowError, Status, StatusCode, TableRef};

/// Upper bound on the buffer space reserved ahead of use.
const PREALLOCATED_ROWS: usize = 1024;

pub(super) enum Command {
    /// Buffer a mutation. The permit is its buffer slot.
    Apply {
        operation: Operation,
        permit: OwnedSemaphorePermit,
    },
    /// Write the buffer now, then acknowledge.
    Flush(oneshot::Sender<()>),
    /// Stop accepting commands, drain, then acknowledge.
    Close(oneshot::Sender<()>),
}

pub(super) struct Flusher {
    connection: ConnectionRef,
    table: Arc<TableRef>,
    timeout: Duration,
    capacity: usize,
    failures: Arc<Mutex<Vec<FlushFailure>>>,
    buffer: Vec<Operation>,
    slots: Vec<OwnedSemaphorePermit>,
}

impl Flusher {
    pub(super) fn new(
        connection: ConnectionRef,
        table: Arc<TableRef>,
        timeout: Duration,
        capacity: usize,
        failures: Arc<Mutex<Vec<FlushFailure>>>,
    ) -> Self {
        Self {
            connection,
            table,
            timeout,
            capacity,
            failures,
            buffer: Vec::with_capacity(capacity.min(PREALLOCATED_ROWS)),
            slots: Vec::with_capacity(capacity.min(PREALLOCATED_ROWS)),
        }
    }

    /// Run until a `Close` command arrives or every sender is dropped.
    ///
    /// After `Close` the channel is closed for new sends but already queued
    /// commands are still processed, so a mutation whose `apply` succeeded is
    /// never lost.
    pub(super) async fn run(mut self, mut commands: mpsc::Receiver<Command>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut close_ack = None;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Apply { operation, permit }) => {
                        self.buffer.push(operation);
                        self.slots.push(permit);
                        if self.buffer.len() >= self.capacity {
                            self.flush().await;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    Some(Command::Close(ack)) => {
                        commands.close();
                        close_ack = Some(ack);
                    }
                    None => break,
                },

                _ = ticker.tick() => self.flush().await,
            }
        }

        self.flush().await;
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
        debug!(table = %self.table.name(), "Flush task finished");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        let slots = std::mem::take(&mut self.slots);
        let rows = batch.len();
        let start = Instant::now();

        let outcome = tokio::time::timeout(
            self.timeout,
            self.connection.write_batch(&self.table, &batch),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(errors)) if errors.is_empty() => None,
            Ok(Ok(errors)) => Some(FlushFailure::RowErrors(errors)),
            Ok(Err(e)) => {
                warn!(table = %self.table.name(), rows, error = %e, "Batch write failed");
                Some(FlushFailure::Unclassified {
                    cause: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    table = %self.table.name(),
                    rows,
                    timeout_ms = self.timeout.as_millis(),
                    "Batch write timed out"
                );
                let status = Status::new(
                    StatusCode::TimedOut,
                    format!("batch of {rows} rows not written within {:?}", self.timeout),
                );
                Some(FlushFailure::RowErrors(
                    batch
                        .into_iter()
                        .map(|op| RowError::new(status.clone(), op))
                        .collect(),
                ))
            }
        };

        emit!(BatchFlushed {
            rows,
            duration: start.elapsed(),
            table: self.table.name().to_string(),
        });

        // Record the outcome before freeing slots so a caller woken by the
        // freed slot sees it.
        if let Some(failure) = failure {
            lock(&self.failures).push(failure);
        }
        drop(slots);

        emit!(BufferedMutations {
            count: self.buffer.len(),
            table: self.table.name().to_string(),
        });
    }
}
