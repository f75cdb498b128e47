//! Commit protocol for tablet output.
//!
//! Mutations are durable once their batch is flushed, so there is nothing to
//! stage, promote or roll back.

use async_trait::async_trait;
use tracing::debug;

use crate::framework::{FrameworkError, JobContext, OutputCommitter, TaskAttemptContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCommitter;

#[async_trait]
impl OutputCommitter for NoopCommitter {
    async fn setup_job(&self, job: &JobContext) -> Result<(), FrameworkError> {
        debug!(job_id = %job.job_id, "Job setup");
        Ok(())
    }

    async fn setup_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError> {
        debug!(attempt_id = %task.attempt_id, "Task setup");
        Ok(())
    }

    fn needs_task_commit(&self, _task: &TaskAttemptContext) -> bool {
        false
    }

    async fn commit_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError> {
        debug!(attempt_id = %task.attempt_id, "Task commit");
        Ok(())
    }

    async fn abort_task(&self, task: &TaskAttemptContext) -> Result<(), FrameworkError> {
        // Already-flushed mutations stay applied.
        debug!(attempt_id = %task.attempt_id, "Task abort");
        Ok(())
    }

    async fn commit_job(&self, job: &JobContext) -> Result<(), FrameworkError> {
        debug!(job_id = %job.job_id, "Job commit");
        Ok(())
    }

    async fn abort_job(&self, job: &JobContext) -> Result<(), FrameworkError> {
        debug!(job_id = %job.job_id, "Job abort");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletsink_core::JobConf;

    #[tokio::test]
    async fn test_every_step_succeeds() {
        let committer = NoopCommitter;
        let job = JobContext::new("job_1", JobConf::new());
        let task = TaskAttemptContext::new("attempt_1", JobConf::new());

        committer.setup_job(&job).await.unwrap();
        committer.setup_task(&task).await.unwrap();
        assert!(!committer.needs_task_commit(&task));
        committer.commit_task(&task).await.unwrap();
        committer.abort_task(&task).await.unwrap();
        committer.commit_job(&job).await.unwrap();
        committer.abort_job(&job).await.unwrap();
    }
}
