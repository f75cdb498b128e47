//! Tablet output format.
//!
//! One [`TabletOutputFormat`] is configured per task. It owns a single
//! [`SessionHandle`] shared by every writer it hands out, registers the
//! table under the task's key so collaborators can find it, and is torn down
//! exactly once: by output validation or by the first writer to close.

mod classify;
mod committer;
mod handle;
mod writer;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, warn};

use tabletsink_core::JobConf;

pub use classify::{Classification, ErrorCounter, classify};
pub use committer::NoopCommitter;
pub use handle::{SessionHandle, TeardownOutcome};
pub use writer::TableRecordWriter;

use crate::client::{Connector, Operation, TableRef};
use crate::config::{OutputConfig, REGISTRY_KEY};
use crate::error::{OutputError, RegistryError, SessionTornDownSnafu, TeardownSnafu};
use crate::framework::{JobContext, OutputFormat, TaskAttemptContext};
use crate::registry::{Registration, TaskKey, TaskRegistry};
use crate::session::lock;

/// Counters published on the task context when a writer closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputCounter {
    /// Rows that failed for a reason other than being already applied.
    RowsWithErrors,
    /// Failures that could not be attributed to rows.
    UnclassifiedFailures,
}

impl OutputCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCounter::RowsWithErrors => "ROWS_WITH_ERRORS",
            OutputCounter::UnclassifiedFailures => "UNCLASSIFIED_FAILURES",
        }
    }
}

/// Where an output registers its table.
#[derive(Debug, Clone)]
pub struct TaskScope {
    pub registry: Arc<TaskRegistry>,
    pub key: TaskKey,
}

impl TaskScope {
    pub fn new(registry: Arc<TaskRegistry>, key: TaskKey) -> Self {
        Self { registry, key }
    }

    /// The process-wide registry, keyed by the calling task.
    pub fn current() -> Self {
        Self::new(TaskRegistry::global(), TaskKey::current())
    }
}

/// State shared by an output and all of its writers.
pub(crate) struct OutputShared {
    handle: SessionHandle,
    registration: Mutex<Option<Registration>>,
    config: OutputConfig,
}

impl OutputShared {
    /// Drain, shut down and unregister. Only the first call does any work.
    async fn teardown(&self) -> Option<TeardownOutcome> {
        let outcome = self.handle.teardown().await;
        let registration = lock(&self.registration).take();
        drop(registration);
        outcome
    }
}

pub struct TabletOutputFormat {
    shared: Arc<OutputShared>,
    task_key: TaskKey,
    conf: JobConf,
}

impl fmt::Debug for TabletOutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TabletOutputFormat")
            .field("task_key", &self.task_key)
            .field("config", &self.shared.config)
            .field("handle", &self.shared.handle)
            .finish_non_exhaustive()
    }
}

impl TabletOutputFormat {
    /// Configure an output for the calling task in the process-wide registry.
    ///
    /// On success the task key is written to `conf` under
    /// [`REGISTRY_KEY`](crate::config::REGISTRY_KEY).
    pub async fn configure(
        conf: &mut JobConf,
        connector: &dyn Connector,
    ) -> Result<Self, OutputError> {
        Self::configure_with(conf, connector, TaskScope::current()).await
    }

    /// Configure an output registered in an explicit scope.
    pub async fn configure_with(
        conf: &mut JobConf,
        connector: &dyn Connector,
        scope: TaskScope,
    ) -> Result<Self, OutputError> {
        let config = OutputConfig::from_conf(conf)?;
        let handle = SessionHandle::open(connector, &config).await?;

        let registration = match scope.registry.register(scope.key.clone(), handle.table()) {
            Ok(registration) => registration,
            Err(source) => {
                // Nothing was written yet; only the connection needs releasing.
                if let Some(TeardownOutcome {
                    shutdown: Err(e), ..
                }) = handle.teardown().await
                {
                    warn!(
                        task_key = %scope.key,
                        error = %e,
                        "Failed to shut down connection after registration failure"
                    );
                }
                return Err(source.into());
            }
        };

        conf.set(REGISTRY_KEY, scope.key.id());
        debug!(task_key = %scope.key, table = %config.table, "Configured output");

        Ok(Self {
            shared: Arc::new(OutputShared {
                handle,
                registration: Mutex::new(Some(registration)),
                config,
            }),
            task_key: scope.key,
            conf: conf.clone(),
        })
    }

    /// Resolve a task's table through the process-wide registry.
    pub fn lookup_table(task_key: &TaskKey) -> Result<Arc<TableRef>, RegistryError> {
        TaskRegistry::global().lookup(task_key)
    }

    /// Resolve the table of the task that published its key into `conf`.
    pub fn table_from_conf(conf: &JobConf) -> Result<Arc<TableRef>, OutputError> {
        Self::table_from_conf_in(conf, &TaskRegistry::global())
    }

    pub fn table_from_conf_in(
        conf: &JobConf,
        registry: &TaskRegistry,
    ) -> Result<Arc<TableRef>, OutputError> {
        let key = TaskKey::new(conf.require(REGISTRY_KEY)?);
        Ok(registry.lookup(&key)?)
    }

    /// The output table, for callers holding the output directly.
    pub fn table(&self) -> &Arc<TableRef> {
        self.shared.handle.table()
    }

    pub fn task_key(&self) -> &TaskKey {
        &self.task_key
    }

    /// The job configuration as published by `configure`.
    pub fn conf(&self) -> &JobConf {
        &self.conf
    }

    pub fn config(&self) -> &OutputConfig {
        &self.shared.config
    }

    /// Validate the output, tearing down its session.
    ///
    /// The session was only needed to prove the table is reachable. After
    /// this call no writer can be created.
    pub async fn check_output_specs(&self, job: &JobContext) -> Result<(), OutputError> {
        debug!(job_id = %job.job_id, table = %self.table().name(), "Validating output");

        let Some(outcome) = self.shared.teardown().await else {
            return Ok(());
        };
        if let Err(e) = outcome.drain {
            warn!(table = %self.table().name(), error = %e, "Session reported failures while tearing down");
        }
        outcome.shutdown.context(TeardownSnafu)
    }

    /// A writer sharing this output's session.
    pub fn record_writer(&self, task: &TaskAttemptContext) -> Result<TableRecordWriter, OutputError> {
        ensure!(!self.shared.handle.is_torn_down(), SessionTornDownSnafu);
        debug!(attempt_id = %task.attempt_id, table = %self.table().name(), "Created record writer");
        Ok(TableRecordWriter::new(Arc::clone(&self.shared)))
    }

    pub fn output_committer(&self, _task: &TaskAttemptContext) -> NoopCommitter {
        NoopCommitter
    }
}

#[async_trait]
impl OutputFormat for TabletOutputFormat {
    type Key = ();
    type Value = Operation;
    type Writer = TableRecordWriter;
    type Committer = NoopCommitter;
    type Error = OutputError;

    async fn check_output_specs(&self, job: &JobContext) -> Result<(), OutputError> {
        TabletOutputFormat::check_output_specs(self, job).await
    }

    fn record_writer(&self, task: &TaskAttemptContext) -> Result<TableRecordWriter, OutputError> {
        TabletOutputFormat::record_writer(self, task)
    }

    fn output_committer(&self, task: &TaskAttemptContext) -> NoopCommitter {
        TabletOutputFormat::output_committer(self, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryCluster;
    use crate::config::OutputConfig;

    fn conf() -> JobConf {
        let mut conf = JobConf::new();
        OutputConfig::new("events", "master-1:7051").write_to(&mut conf);
        conf
    }

    fn scope(key: &str) -> TaskScope {
        TaskScope::new(Arc::new(TaskRegistry::new()), TaskKey::new(key))
    }

    #[tokio::test]
    async fn test_configure_publishes_task_key() {
        let cluster = MemoryCluster::new();
        cluster.create_table("events", &["id"]);
        let registry = Arc::new(TaskRegistry::new());
        let mut conf = conf();

        let format = TabletOutputFormat::configure_with(
            &mut conf,
            &cluster,
            TaskScope::new(Arc::clone(&registry), TaskKey::new("task-7")),
        )
        .await
        .unwrap();

        assert_eq!(conf.get(REGISTRY_KEY), Some("task-7"));
        assert_eq!(format.conf().get(REGISTRY_KEY), Some("task-7"));
        let table = TabletOutputFormat::table_from_conf_in(&conf, &registry).unwrap();
        assert!(Arc::ptr_eq(&table, format.table()));
    }

    #[tokio::test]
    async fn test_validation_tears_down() {
        let cluster = MemoryCluster::new();
        cluster.create_table("events", &["id"]);
        let mut conf = conf();
        let format = TabletOutputFormat::configure_with(&mut conf, &cluster, scope("task-1"))
            .await
            .unwrap();
        let job = JobContext::new("job_1", conf.clone());

        format.check_output_specs(&job).await.unwrap();
        assert_eq!(cluster.open_connections(), 0);
        format.check_output_specs(&job).await.unwrap();

        let err = format
            .record_writer(&TaskAttemptContext::new("attempt_1", conf))
            .unwrap_err();
        assert!(matches!(err, OutputError::SessionTornDown));
    }

    #[test]
    fn test_counter_names() {
        assert_eq!(OutputCounter::RowsWithErrors.as_str(), "ROWS_WITH_ERRORS");
        assert_eq!(
            OutputCounter::UnclassifiedFailures.as_str(),
            "UNCLASSIFIED_FAILURES"
        );
    }

    #[tokio::test]
    async fn test_missing_config_is_fatal() {
        let cluster = MemoryCluster::new();
        let mut conf = JobConf::new();
        let err = TabletOutputFormat::configure_with(&mut conf, &cluster, scope("task-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OutputError::Config { .. }));
        assert!(err.is_fatal());
        assert_eq!(cluster.open_connections(), 0);
    }
}
