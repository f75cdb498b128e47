//! Batch framework contract.
//!
//! A batch job hands every output record of a task to a [`RecordWriter`]
//! obtained from an [`OutputFormat`], and drives the commit protocol through
//! an [`OutputCommitter`]. Contexts carry the job configuration and the
//! per-task counters the framework aggregates.

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use tabletsink_core::JobConf;

/// Error type used by the commit protocol.
pub type FrameworkError = Box<dyn Error + Send + Sync>;

/// Named task counters.
#[derive(Debug, Default)]
pub struct Counters {
    values: DashMap<String, u64>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a counter.
    pub fn set(&self, name: &str, value: u64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn increment(&self, name: &str, by: u64) {
        *self.values.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).map(|v| *v)
    }
}

/// Job-wide context.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub conf: JobConf,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, conf: JobConf) -> Self {
        Self {
            job_id: job_id.into(),
            conf,
        }
    }
}

/// Context of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskAttemptContext {
    pub attempt_id: String,
    pub conf: JobConf,
    pub counters: Arc<Counters>,
}

impl TaskAttemptContext {
    pub fn new(attempt_id: impl Into<String>, conf: JobConf) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            conf,
            counters: Arc::new(Counters::new()),
        }
    }
}

/// Receives a task's output records.
#[async_trait]
pub trait RecordWriter<K, V>: Send
where
    K: Send + 'static,
    V: Send + 'static,
{
    type Error: Error + Send + Sync + 'static;

    async fn write(&mut self, key: K, value: V) -> Result<(), Self::Error>;

    /// Finish the writer, publishing counters to `ctx` when given.
    async fn close(&mut self, ctx: Option<&TaskAttemptContext>) -> Result<(), Self::Error>;
}

/// Commit protocol for job and task output.
#[async_trait]
pub trait OutputCommitter: Send + Sync {
    async fn setup_job(&self, job: &JobContext) -> Result<(), FrameworkError>;

    async fn setup_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError>;

    fn needs_task_commit(&self, task: &TaskAttemptContext) -> bool;

    async fn commit_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError>;

    async fn abort_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError>;

    async fn commit_job(&self, job: &JobContext) -> Result<(), FrameworkError>;

    async fn abort_job(&self, job: &JobContext) -> Result<(), FrameworkError>;
}

/// Produces writers and a committer for a job's output.
#[async_trait]
pub trait OutputFormat: Send + Sync {
    type Key: Send + 'static;
    type Value: Send + 'static;
    type Writer: RecordWriter<Self::Key, Self::Value>;
    type Committer: OutputCommitter;
    type Error: Error + Send + Sync + 'static;

    /// Validate the output before any task runs.
    async fn check_output_specs(&self, job: &JobContext) -> Result<(), Self::Error>;

    fn record_writer(&self, task: &TaskAttemptContext) -> Result<Self::Writer, Self::Error>;

    fn output_committer(&self, task: &TaskAttemptContext) -> Self::Committer;
}
