//! tabletsink: write batch-job output into a tablet storage cluster.
//!
//! This crate handles:
//! - Opening one connection, table handle and buffered session per task
//! - Publishing the task's table handle through a process-wide registry so
//!   sibling components (partitioners, mappers) can reach it
//! - Forwarding each output record into a background-flushed session with
//!   bounded buffering and backpressure
//! - Classifying row failures and reporting a final error count at close
//! - A no-op commit protocol, since applied mutations are already durable

pub mod client;
pub mod config;
pub mod error;
pub mod framework;
pub mod output;
pub mod registry;
pub mod session;

pub use client::{
    ConnectionRef, Connector, Operation, OperationKind, Row, RowError, Status, StatusCode, TableRef,
};
pub use config::{OutputConfig, UnclassifiedPolicy};
pub use error::{ClientError, OutputError, RegistryError, SessionError, WriterError};
pub use framework::{
    Counters, JobContext, OutputCommitter, OutputFormat, RecordWriter, TaskAttemptContext,
};
pub use output::{
    Classification, ErrorCounter, NoopCommitter, OutputCounter, SessionHandle, TableRecordWriter,
    TabletOutputFormat, TaskScope, classify,
};
pub use registry::{Registration, TaskKey, TaskRegistry};
pub use session::{FlushFailure, FlushMode, Session, SessionOptions};

pub use tabletsink_core::{ConfigError, JobConf};
