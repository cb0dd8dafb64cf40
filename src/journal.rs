//! Durable record of broker job state.
//!
//! Every job transition is written here while the job's lock is held, so a
//! restarted broker can rebuild its table with [`crate::broker::Broker::recover`].
//! Jobs that were in flight at the time of the crash come back as pending.

use async_trait::async_trait;
use redis::aio::Connection;
use redis::Client;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{TaskError, TaskResult};
use crate::job::{Job, JobId};

const JOBS_KEY: &str = "tasklane:jobs";

#[async_trait]
pub trait Journal: Send + Sync {
    /// Record the latest state of a job, replacing any earlier record
    async fn record(&self, job: &Job) -> TaskResult<()>;

    /// Forget a job after it has been garbage-collected
    async fn remove(&self, job_id: JobId) -> TaskResult<()>;

    /// Every recorded job
    async fn load(&self) -> TaskResult<Vec<Job>>;
}

/// Journal that keeps nothing; broker state lives and dies with the process
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJournal;

#[async_trait]
impl Journal for NoopJournal {
    async fn record(&self, _job: &Job) -> TaskResult<()> {
        Ok(())
    }

    async fn remove(&self, _job_id: JobId) -> TaskResult<()> {
        Ok(())
    }

    async fn load(&self) -> TaskResult<Vec<Job>> {
        Ok(Vec::new())
    }
}

/// Journal held in memory, shareable between broker instances in one process
#[derive(Debug, Default)]
pub struct MemoryJournal {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn record(&self, job: &Job) -> TaskResult<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> TaskResult<()> {
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }

    async fn load(&self) -> TaskResult<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }
}

/// Journal stored in a Redis hash keyed by job id
#[derive(Debug)]
pub struct RedisJournal {
    client: Client,
}

impl RedisJournal {
    pub async fn connect(redis_url: &str) -> TaskResult<Self> {
        let client =
            Client::open(redis_url).map_err(|e| TaskError::backend("connect", e.to_string()))?;

        let mut conn = client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::backend("connect", e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("ping", e.to_string()))?;

        info!("Journal connected to Redis at {}", redis_url);
        Ok(Self { client })
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::backend("get_connection", e.to_string()))
    }
}

#[async_trait]
impl Journal for RedisJournal {
    async fn record(&self, job: &Job) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let job_json = serde_json::to_string(job)?;

        redis::cmd("HSET")
            .arg(JOBS_KEY)
            .arg(job.id.to_string())
            .arg(job_json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("journal_record", e.to_string()))?;

        debug!("Journaled job {} as {}", job.id, job.state);
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("HDEL")
            .arg(JOBS_KEY)
            .arg(job_id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("journal_remove", e.to_string()))?;
        Ok(())
    }

    async fn load(&self) -> TaskResult<Vec<Job>> {
        let mut conn = self.get_connection().await?;
        let entries: Vec<String> = redis::cmd("HVALS")
            .arg(JOBS_KEY)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("journal_load", e.to_string()))?;

        entries
            .iter()
            .map(|json| serde_json::from_str(json).map_err(TaskError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSpec, JobState};
    use crate::retry::RetryPolicy;
    use chrono::Utc;
    use serde_json::json;

    fn job() -> Job {
        Job::from_spec(
            JobSpec::new("resize", json!({"width": 64})),
            "default",
            &RetryPolicy::default(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn memory_journal_keeps_the_latest_record() {
        let journal = MemoryJournal::new();
        let mut job = job();
        journal.record(&job).await.unwrap();

        job.state = JobState::Failed;
        journal.record(&job).await.unwrap();

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, JobState::Failed);

        journal.remove(job.id).await.unwrap();
        assert!(journal.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Redis: cargo test -- --ignored
    async fn redis_journal_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let journal = RedisJournal::connect(&url).await.unwrap();
        let job = job();
        journal.record(&job).await.unwrap();
        assert!(journal.load().await.unwrap().iter().any(|j| j.id == job.id));
        journal.remove(job.id).await.unwrap();
    }
}
