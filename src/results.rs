//! Result store: terminal outcomes kept for a limited time

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::Connection;
use redis::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{TaskError, TaskResult};
use crate::job::{JobId, JobState};

const RESULTS_KEY: &str = "tasklane:results";

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    /// `Succeeded` or `Failed`
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

/// Answer of a result lookup.
///
/// Expired and never-submitted ids both come back as `Unknown`; no tombstones are kept.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultLookup {
    Ready(JobOutcome),
    /// Known but not finished yet
    NotReady(JobState),
    Unknown,
}

impl ResultLookup {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_outcome(self) -> Option<JobOutcome> {
        match self {
            Self::Ready(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Storage for terminal outcomes
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Persist (or overwrite) the outcome for `job_id`, expiring after `ttl`
    async fn store(&self, outcome: &JobOutcome, ttl: Duration) -> TaskResult<()>;

    /// Fetch a live outcome; `None` when expired or never stored
    async fn fetch(&self, job_id: JobId) -> TaskResult<Option<JobOutcome>>;

    /// Drop expired entries, returning how many were removed
    async fn purge_expired(&self) -> TaskResult<u64>;
}

#[derive(Debug, Clone)]
struct StoredOutcome {
    outcome: JobOutcome,
    expires_at: DateTime<Utc>,
}

/// In-process result backend
#[derive(Debug, Default)]
pub struct MemoryResultBackend {
    entries: RwLock<HashMap<JobId, StoredOutcome>>,
}

impl MemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn store(&self, outcome: &JobOutcome, ttl: Duration) -> TaskResult<()> {
        let stored = StoredOutcome {
            outcome: outcome.clone(),
            expires_at: Utc::now() + ttl,
        };
        self.entries.write().await.insert(outcome.job_id, stored);
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> TaskResult<Option<JobOutcome>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&job_id)
            .filter(|stored| stored.expires_at > Utc::now())
            .map(|stored| stored.outcome.clone()))
    }

    async fn purge_expired(&self) -> TaskResult<u64> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

/// Result backend storing outcomes as JSON strings with a Redis `PX` expiry
#[derive(Debug)]
pub struct RedisResultBackend {
    client: Client,
}

impl RedisResultBackend {
    /// Connect and verify the server answers `PING`
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

        info!("Result backend connected to Redis at {}", redis_url);
        Ok(Self { client })
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::backend("get_connection", e.to_string()))
    }

    fn key(job_id: JobId) -> String {
        format!("{}:{}", RESULTS_KEY, job_id)
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn store(&self, outcome: &JobOutcome, ttl: Duration) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(outcome)?;
        let ttl_ms = ttl.num_milliseconds().max(1);

        redis::cmd("SET")
            .arg(Self::key(outcome.job_id))
            .arg(json)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("store_result", e.to_string()))?;

        debug!("Stored result for job {} (ttl {}ms)", outcome.job_id, ttl_ms);
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> TaskResult<Option<JobOutcome>> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(Self::key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("fetch_result", e.to_string()))?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn purge_expired(&self) -> TaskResult<u64> {
        // Redis expires keys on its own
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(job_id: JobId) -> JobOutcome {
        JobOutcome {
            job_id,
            state: JobState::Succeeded,
            result: Some(json!(42)),
            error: None,
            attempts: 1,
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn stored_result_is_fetched_until_expiry() {
        let backend = MemoryResultBackend::new();
        let stored = outcome(JobId::new_v4());
        backend
            .store(&stored, Duration::milliseconds(50))
            .await
            .unwrap();
        assert_eq!(backend.fetch(stored.job_id).await.unwrap(), Some(stored.clone()));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(backend.fetch(stored.job_id).await.unwrap(), None);
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn storing_twice_overwrites() {
        let backend = MemoryResultBackend::new();
        let id = JobId::new_v4();
        backend.store(&outcome(id), Duration::seconds(10)).await.unwrap();

        let mut failed = outcome(id);
        failed.state = JobState::Failed;
        failed.result = None;
        failed.error = Some("boom".into());
        backend.store(&failed, Duration::seconds(10)).await.unwrap();

        let fetched = backend.fetch(id).await.unwrap().unwrap();
        assert!(!fetched.succeeded());
        assert_eq!(fetched.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis: cargo test -- --ignored
    async fn redis_backend_round_trip() {
        let url = std::env::var("TASKLANE_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let backend = RedisResultBackend::connect(&url).await.unwrap();
        let id = JobId::new_v4();
        backend.store(&outcome(id), Duration::seconds(5)).await.unwrap();
        assert_eq!(backend.fetch(id).await.unwrap().map(|o| o.job_id), Some(id));
        assert_eq!(backend.fetch(JobId::new_v4()).await.unwrap(), None);
    }
}
