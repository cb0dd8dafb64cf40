//! Client interface for submitting jobs and reading their outcomes

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, JobStatus};
use crate::config::BrokerConfig;
use crate::error::{TaskError, TaskResult};
use crate::job::{JobId, JobSpec, Task};
use crate::queue::QueueStats;
use crate::results::{JobOutcome, ResultLookup};
use crate::workflow::{ChordFailureMode, GroupMode, WorkflowId, WorkflowState, WorkflowStatus};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Producer and status facade over a shared [`Broker`]
#[derive(Debug, Clone)]
pub struct Client {
    broker: Arc<Broker>,
}

impl Client {
    /// Create a client over a new broker built from `config`
    pub async fn new(config: BrokerConfig) -> TaskResult<Self> {
        let broker = Arc::new(Broker::connect(config).await?);
        Ok(Self { broker })
    }

    /// Create a client over a new broker configured from the environment
    pub async fn from_env() -> TaskResult<Self> {
        Self::new(BrokerConfig::from_env()?).await
    }

    /// Create a client from an existing broker
    pub fn from_broker(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    /// Submit a job
    pub async fn submit(&self, spec: JobSpec) -> TaskResult<JobId> {
        self.broker.submit(spec).await
    }

    /// Submit a typed task to a specific queue
    pub async fn submit_task<T: Task>(&self, task: &T, queue: &str) -> TaskResult<JobId> {
        self.broker.submit_task(task, queue).await
    }

    /// Submit a job that must not run before `eta`
    pub async fn submit_at(&self, spec: JobSpec, eta: DateTime<Utc>) -> TaskResult<JobId> {
        self.submit(spec.eta(eta)).await
    }

    /// Submit a job that must not run before `delay` has elapsed
    pub async fn submit_after(&self, spec: JobSpec, delay: Duration) -> TaskResult<JobId> {
        self.submit(spec.countdown(delay)).await
    }

    /// Submit several jobs at once
    pub async fn submit_batch(&self, specs: Vec<JobSpec>) -> TaskResult<Vec<JobId>> {
        let mut job_ids = Vec::with_capacity(specs.len());
        for spec in specs {
            job_ids.push(self.submit(spec).await?);
        }
        Ok(job_ids)
    }

    pub async fn chain(&self, steps: Vec<JobSpec>) -> TaskResult<WorkflowId> {
        self.broker.submit_chain(steps).await
    }

    pub async fn group(&self, members: Vec<JobSpec>) -> TaskResult<WorkflowId> {
        self.broker.submit_group(members, GroupMode::default()).await
    }

    pub async fn group_with_mode(
        &self,
        members: Vec<JobSpec>,
        mode: GroupMode,
    ) -> TaskResult<WorkflowId> {
        self.broker.submit_group(members, mode).await
    }

    pub async fn chord(&self, members: Vec<JobSpec>, reducer: JobSpec) -> TaskResult<WorkflowId> {
        self.broker
            .submit_chord(members, reducer, ChordFailureMode::default())
            .await
    }

    pub async fn chord_with_mode(
        &self,
        members: Vec<JobSpec>,
        reducer: JobSpec,
        mode: ChordFailureMode,
    ) -> TaskResult<WorkflowId> {
        self.broker.submit_chord(members, reducer, mode).await
    }

    /// Get job status by ID
    pub async fn get_state(&self, job_id: JobId) -> TaskResult<JobStatus> {
        self.broker.get_state(job_id).await
    }

    pub async fn get_result(&self, job_id: JobId) -> TaskResult<ResultLookup> {
        self.broker.get_result(job_id).await
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> TaskResult<WorkflowStatus> {
        self.broker.get_workflow(workflow_id).await
    }

    /// Wait for a job to reach a terminal state and return its outcome
    pub async fn wait_for_outcome(
        &self,
        job_id: JobId,
        timeout: Option<Duration>,
    ) -> TaskResult<JobOutcome> {
        let start_time = std::time::Instant::now();

        loop {
            if let Some(timeout) = timeout {
                if start_time.elapsed() > timeout {
                    return Err(TaskError::timeout("wait_for_result"));
                }
            }

            match self.broker.get_result(job_id).await? {
                ResultLookup::Ready(outcome) => return Ok(outcome),
                ResultLookup::NotReady(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                ResultLookup::Unknown => return Err(TaskError::job_not_found(job_id)),
            }
        }
    }

    /// Wait for a job to succeed and decode its result
    pub async fn wait_for_result<T>(&self, job_id: JobId, timeout: Option<Duration>) -> TaskResult<T>
    where
        T: DeserializeOwned,
    {
        let outcome = self.wait_for_outcome(job_id, timeout).await?;
        if !outcome.succeeded() {
            return Err(TaskError::JobFailed {
                job_id: job_id.to_string(),
                message: outcome.error.unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
        let value = outcome.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Submit and wait for result in one call
    pub async fn submit_and_wait<T, R>(
        &self,
        task: &T,
        queue: &str,
        timeout: Option<Duration>,
    ) -> TaskResult<R>
    where
        T: Task,
        R: DeserializeOwned,
    {
        let job_id = self.submit_task(task, queue).await?;
        self.wait_for_result(job_id, timeout).await
    }

    /// Wait for a workflow to finish and return its final status
    pub async fn wait_for_workflow(
        &self,
        workflow_id: WorkflowId,
        timeout: Option<Duration>,
    ) -> TaskResult<WorkflowStatus> {
        let start_time = std::time::Instant::now();

        loop {
            let status = self.broker.get_workflow(workflow_id).await?;
            if status.state != WorkflowState::Running {
                return Ok(status);
            }
            if let Some(timeout) = timeout {
                if start_time.elapsed() > timeout {
                    return Err(TaskError::timeout("wait_for_workflow"));
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Get queue statistics
    pub async fn queue_stats(&self, queue: &str) -> QueueStats {
        self.broker.queue_stats(queue).await
    }

    /// List all known queues
    pub async fn list_queues(&self) -> Vec<String> {
        self.broker.list_queues().await
    }

    /// Get access to the underlying broker for advanced operations
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn wait_for_result_reports_unknown_ids() {
        let client = Client::from_broker(Arc::new(Broker::new_default().unwrap()));
        let err = client
            .wait_for_result::<i64>(JobId::new_v4(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn wait_for_result_times_out_on_unfinished_jobs() {
        let client = Client::from_broker(Arc::new(Broker::new_default().unwrap()));
        let id = client.submit(JobSpec::new("never", json!(null))).await.unwrap();
        let err = client
            .wait_for_result::<i64>(id, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Timeout { .. }));
    }

    #[tokio::test]
    async fn delayed_submission_is_not_ready_yet() {
        let client = Client::from_broker(Arc::new(Broker::new_default().unwrap()));
        client
            .submit_after(JobSpec::new("later", json!(null)), Duration::from_secs(60))
            .await
            .unwrap();

        let stats = client.queue_stats("default").await;
        assert_eq!(stats.delayed_jobs, 1);
        assert_eq!(stats.ready_jobs, 0);
        assert!(client
            .broker()
            .claim("a", &["default"], 1)
            .await
            .unwrap()
            .is_none());
    }
}
