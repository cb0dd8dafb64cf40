//! The broker: shared job table, queue lanes and dispatcher.
//!
//! A [`Broker`] is an explicit context object; wrap it in an `Arc` and hand it
//! to clients, workers and the housekeeper. Every job sits behind its own lock
//! and each state change happens while that lock is held, so claims, acks,
//! retries and lease expiry never race on the same job.
//!
//! Lock order is lanes, then a single job. A job lock is never held while
//! waiting for the lanes.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{TaskError, TaskResult};
use crate::job::{Job, JobId, JobSpec, JobState, Progress, Task};
use crate::journal::{Journal, NoopJournal, RedisJournal};
use crate::lease::{Lease, LeaseStatus, SlotId};
use crate::queue::{Lanes, QueueStats};
use crate::results::{MemoryResultBackend, RedisResultBackend, ResultBackend, ResultLookup};
use crate::retry::RetryPolicy;
use crate::workflow::{ChordFailureMode, Composer, GroupMode, WorkflowId, WorkflowStatus};

/// A job handed to a worker slot together with the lease that owns it
#[derive(Debug, Clone)]
pub struct Claim {
    /// Snapshot of the job at claim time
    pub job: Job,
    pub lease: Lease,
}

/// Answer of the status API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    /// `None` when the id is unknown: never submitted, or expired
    pub state: Option<JobState>,
    pub attempt_count: u32,
    pub progress: Option<Progress>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobStatus {
    fn unknown(job_id: JobId) -> Self {
        Self {
            job_id,
            state: None,
            attempt_count: 0,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.state.is_none()
    }
}

impl From<&Job> for JobStatus {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: Some(job.state),
            attempt_count: job.attempt_count,
            progress: job.progress.clone(),
            result: job.result.clone(),
            error: job.error.clone(),
        }
    }
}

pub(crate) type JobEntry = Arc<Mutex<Job>>;

/// Job broker shared by producers and workers
pub struct Broker {
    pub(crate) config: BrokerConfig,
    pub(crate) retry_policy: RetryPolicy,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    lanes: Mutex<Lanes>,
    /// Jobs waiting in `RetryScheduled`
    retrying: Mutex<HashSet<JobId>>,
    /// Jobs currently assigned to each slot, for prefetch accounting
    held: Mutex<HashMap<SlotId, usize>>,
    notify: Notify,
    pub(crate) results: Arc<dyn ResultBackend>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) workflows: Composer,
    /// Continuation jobs whose enqueue failed after their upstream finished
    pub(crate) continuations: Mutex<Vec<Job>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Create an in-process broker with in-memory results and no journal
    pub fn new(config: BrokerConfig) -> TaskResult<Self> {
        Self::with_backends(
            config,
            Arc::new(MemoryResultBackend::new()),
            Arc::new(NoopJournal),
        )
    }

    /// Create a broker with default configuration
    pub fn new_default() -> TaskResult<Self> {
        Self::new(BrokerConfig::default())
    }

    /// Create a broker over the given result backend and journal
    pub fn with_backends(
        config: BrokerConfig,
        results: Arc<dyn ResultBackend>,
        journal: Arc<dyn Journal>,
    ) -> TaskResult<Self> {
        config.validate()?;
        if !config.acks_late {
            warn!(
                "acks_late is disabled: jobs are acknowledged at claim time and a worker crash \
                 loses them (at-most-once delivery)"
            );
        }
        let retry_policy = config.retry_policy();
        let workflows = Composer::new(config.default_queue.clone(), retry_policy.clone());

        Ok(Self {
            config,
            retry_policy,
            jobs: RwLock::new(HashMap::new()),
            lanes: Mutex::new(Lanes::new()),
            retrying: Mutex::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            results,
            journal,
            workflows,
            continuations: Mutex::new(Vec::new()),
        })
    }

    /// Create a broker backed by Redis when `redis_url` is configured, and
    /// recover any journaled jobs
    pub async fn connect(config: BrokerConfig) -> TaskResult<Self> {
        let broker = match config.redis_url.clone() {
            Some(url) => {
                let results = Arc::new(RedisResultBackend::connect(&url).await?);
                let journal = Arc::new(RedisJournal::connect(&url).await?);
                Self::with_backends(config, results, journal)?
            }
            None => Self::new(config)?,
        };
        broker.recover().await?;
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) async fn entry(&self, job_id: JobId) -> Option<JobEntry> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub(crate) async fn entries(&self) -> Vec<JobEntry> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub(crate) fn build_job(&self, spec: JobSpec) -> Job {
        Job::from_spec(spec, &self.config.default_queue, &self.retry_policy, Utc::now())
    }

    /// Submit a job; returns its id
    pub async fn submit(&self, spec: JobSpec) -> TaskResult<JobId> {
        let job = self.build_job(spec);
        self.enqueue(job).await
    }

    /// Submit a typed task to a queue
    pub async fn submit_task<T: Task>(&self, task: &T, queue: &str) -> TaskResult<JobId> {
        self.submit(JobSpec::from_task(task)?.on_queue(queue)).await
    }

    /// Add a pending job to the tail of its lane and wake pollers
    pub(crate) async fn enqueue(&self, job: Job) -> TaskResult<JobId> {
        if job.state != JobState::Pending {
            return Err(TaskError::InvalidTransition {
                job_id: job.id.to_string(),
                from: job.state.to_string(),
                to: JobState::Pending.to_string(),
            });
        }
        let job_id = job.id;
        let queue = job.queue.clone();

        self.journal.record(&job).await?;
        self.jobs
            .write()
            .await
            .insert(job_id, Arc::new(Mutex::new(job)));
        self.lanes.lock().await.push_back(&queue, job_id);
        self.notify.notify_waiters();

        debug!("Enqueued job {} on queue {}", job_id, queue);
        Ok(job_id)
    }

    /// Track a job that is already terminal (never enqueued)
    pub(crate) async fn insert_finished(&self, job: Job) -> TaskResult<()> {
        self.journal.record(&job).await?;
        self.jobs
            .write()
            .await
            .insert(job.id, Arc::new(Mutex::new(job)));
        Ok(())
    }

    /// Put an existing pending job back at the tail of its lane
    pub(crate) async fn push_ready(&self, queue: &str, job_id: JobId) {
        self.lanes.lock().await.push_back(queue, job_id);
        self.notify.notify_waiters();
    }

    pub(crate) async fn mark_retrying(&self, job_id: JobId) {
        self.retrying.lock().await.insert(job_id);
    }

    /// Release one prefetch unit held by `slot`
    pub(crate) async fn release_slot(&self, slot: &str) {
        let mut held = self.held.lock().await;
        if let Some(count) = held.get_mut(slot) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                held.remove(slot);
            }
        }
    }

    /// Number of jobs currently assigned to `slot`
    pub async fn held_by(&self, slot: &str) -> usize {
        self.held.lock().await.get(slot).copied().unwrap_or(0)
    }

    /// Move every due `RetryScheduled` job back to `Pending`
    pub async fn promote_due_retries(&self) -> TaskResult<usize> {
        let candidates: Vec<JobId> = self.retrying.lock().await.iter().copied().collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut promoted = 0;
        for job_id in candidates {
            let Some(entry) = self.entry(job_id).await else {
                self.retrying.lock().await.remove(&job_id);
                continue;
            };
            let queue = {
                let mut job = entry.lock().await;
                if job.state != JobState::RetryScheduled {
                    drop(job);
                    self.retrying.lock().await.remove(&job_id);
                    continue;
                }
                let mut next = job.clone();
                if !next.promote_if_due(now) {
                    continue;
                }
                self.journal.record(&next).await?;
                *job = next;
                job.queue.clone()
            };
            self.retrying.lock().await.remove(&job_id);
            self.push_ready(&queue, job_id).await;
            promoted += 1;
        }

        if promoted > 0 {
            debug!("Promoted {} retry-scheduled jobs", promoted);
        }
        Ok(promoted)
    }

    /// Claim up to `count` eligible jobs from the named queues without waiting.
    ///
    /// Lanes are consulted in the order given and FIFO within each lane. The
    /// slot never holds more than `prefetch` jobs at once.
    pub async fn try_claim<S: AsRef<str>>(
        &self,
        slot: &str,
        queues: &[S],
        count: usize,
        prefetch: usize,
    ) -> TaskResult<Vec<Claim>> {
        self.promote_due_retries().await?;

        let reserved = {
            let mut held = self.held.lock().await;
            let current = held.entry(slot.to_string()).or_insert(0);
            let available = prefetch.saturating_sub(*current).min(count);
            *current += available;
            available
        };
        if reserved == 0 {
            self.release_reservation(slot, 0, 0).await;
            return Ok(Vec::new());
        }

        let result = self.claim_reserved(slot, queues, reserved).await;
        let claimed = result.as_ref().map_or(0, Vec::len);
        self.release_reservation(slot, reserved, claimed).await;
        result
    }

    async fn release_reservation(&self, slot: &str, reserved: usize, claimed: usize) {
        let mut held = self.held.lock().await;
        if let Some(current) = held.get_mut(slot) {
            *current = current.saturating_sub(reserved - claimed);
            if *current == 0 {
                held.remove(slot);
            }
        }
    }

    async fn claim_reserved<S: AsRef<str>>(
        &self,
        slot: &str,
        queues: &[S],
        limit: usize,
    ) -> TaskResult<Vec<Claim>> {
        let now = Utc::now();
        let lease_ttl = self.config.acks_late.then(|| self.config.lease_ttl());
        let mut claimed = Vec::new();
        let mut exhausted = Vec::new();

        let mut lanes = self.lanes.lock().await;
        for queue in queues {
            if claimed.len() >= limit {
                break;
            }
            let Some(lane) = lanes.lane_mut(queue.as_ref()) else {
                continue;
            };

            let mut index = 0;
            while index < lane.len() && claimed.len() < limit {
                let job_id = lane[index];
                let Some(entry) = self.entry(job_id).await else {
                    lane.remove(index);
                    continue;
                };
                let mut job = entry.lock().await;
                if job.state != JobState::Pending {
                    lane.remove(index);
                    continue;
                }
                if !job.is_eligible(now) {
                    index += 1;
                    continue;
                }
                if job.attempts_exhausted() {
                    let mut next = job.clone();
                    next.mark_failed("no attempts left to dispatch", now)?;
                    self.journal.record(&next).await?;
                    *job = next;
                    lane.remove(index);
                    error!("Job {} ({}) failed: no attempts left to dispatch", job.id, job.name);
                    exhausted.push(job.clone());
                    continue;
                }

                let lease = Lease::issue(job_id, slot, lease_ttl, now);
                let mut next = job.clone();
                next.assign(lease.clone(), now)?;
                self.journal.record(&next).await?;
                *job = next;
                lane.remove(index);

                info!(
                    "Assigned job {} ({}) to slot {} (attempt {}/{})",
                    job.id, job.name, slot, job.attempt_count, job.max_attempts
                );
                claimed.push(Claim {
                    job: job.clone(),
                    lease,
                });
            }
        }
        drop(lanes);

        for job in exhausted {
            self.finalize(job).await;
        }
        Ok(claimed)
    }

    /// Claim up to `count` jobs, waiting up to `timeout` for one to become available.
    ///
    /// No lock is held while waiting, so idle pollers never block each other.
    pub async fn poll<S: AsRef<str>>(
        &self,
        slot: &str,
        queues: &[S],
        count: usize,
        timeout: Duration,
    ) -> TaskResult<Vec<Claim>> {
        let prefetch = self.config.prefetch_multiplier as usize;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            let claimed = self.try_claim(slot, queues, count, prefetch).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(self.config.poll_interval());
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Claim a single job if one is eligible right now
    pub async fn claim<S: AsRef<str>>(
        &self,
        slot: &str,
        queues: &[S],
        prefetch: usize,
    ) -> TaskResult<Option<Claim>> {
        Ok(self
            .try_claim(slot, queues, 1, prefetch)
            .await?
            .into_iter()
            .next())
    }

    /// `Assigned -> Running` for the job owned by `lease`
    pub async fn start(&self, lease: &Lease) -> TaskResult<LeaseStatus> {
        let Some(entry) = self.entry(lease.job_id).await else {
            return Ok(LeaseStatus::Lost);
        };
        let mut job = entry.lock().await;
        if !job.holds(lease) {
            return Ok(LeaseStatus::Lost);
        }

        let now = Utc::now();
        if job.lease.as_ref().map_or(false, |l| l.is_expired(now)) {
            let expiry = self.expire_locked(&mut job, now).await?;
            drop(job);
            warn!("Lease on job {} expired before it started", lease.job_id);
            self.after_expiry(lease, expiry).await;
            return Ok(LeaseStatus::Lost);
        }

        let mut next = job.clone();
        next.mark_running(now)?;
        let ttl = self.config.lease_ttl();
        if let Some(held) = next.lease.as_mut() {
            held.renew(ttl, now);
        }
        self.journal.record(&next).await?;
        *job = next;

        debug!("Job {} running on slot {}", job.id, lease.slot);
        Ok(LeaseStatus::Active {
            expires_at: job.lease.as_ref().and_then(|l| l.expires_at),
        })
    }

    /// Status API: current state, progress and outcome of a job
    pub async fn get_state(&self, job_id: JobId) -> TaskResult<JobStatus> {
        if let Some(entry) = self.entry(job_id).await {
            let job = entry.lock().await;
            if !self.is_expired(&job) {
                return Ok(JobStatus::from(&*job));
            }
            return Ok(JobStatus::unknown(job_id));
        }

        Ok(match self.results.fetch(job_id).await? {
            Some(outcome) => JobStatus {
                job_id,
                state: Some(outcome.state),
                attempt_count: outcome.attempts,
                progress: None,
                result: outcome.result,
                error: outcome.error,
            },
            None => JobStatus::unknown(job_id),
        })
    }

    /// Terminal outcome of a job, if it finished and has not expired
    pub async fn get_result(&self, job_id: JobId) -> TaskResult<ResultLookup> {
        if let Some(entry) = self.entry(job_id).await {
            let job = entry.lock().await;
            if self.is_expired(&job) {
                return Ok(ResultLookup::Unknown);
            }
            if let Some(outcome) = job.outcome() {
                return Ok(ResultLookup::Ready(outcome));
            }
            return Ok(ResultLookup::NotReady(job.state));
        }

        Ok(match self.results.fetch(job_id).await? {
            Some(outcome) => ResultLookup::Ready(outcome),
            None => ResultLookup::Unknown,
        })
    }

    /// Terminal and older than the result TTL
    pub(crate) fn is_expired(&self, job: &Job) -> bool {
        job.is_terminal()
            && job
                .finished_at
                .map_or(false, |t| t + self.config.result_ttl() <= Utc::now())
    }

    /// Submit a chain; each step runs only after the previous one succeeded
    pub async fn submit_chain(&self, steps: Vec<JobSpec>) -> TaskResult<WorkflowId> {
        let (workflow_id, first) = self.workflows.create_chain(steps).await?;
        self.enqueue(first).await?;
        info!("Submitted chain {}", workflow_id);
        Ok(workflow_id)
    }

    /// Submit a group of independent jobs
    pub async fn submit_group(&self, members: Vec<JobSpec>, mode: GroupMode) -> TaskResult<WorkflowId> {
        let (workflow_id, jobs) = self.workflows.create_group(members, mode).await?;
        for job in jobs {
            self.enqueue(job).await?;
        }
        info!("Submitted group {}", workflow_id);
        Ok(workflow_id)
    }

    /// Submit a chord: a group whose ordered results feed a reducer job
    pub async fn submit_chord(
        &self,
        members: Vec<JobSpec>,
        reducer: JobSpec,
        mode: ChordFailureMode,
    ) -> TaskResult<WorkflowId> {
        let (workflow_id, jobs) = self.workflows.create_chord(members, reducer, mode).await?;
        for job in jobs {
            self.enqueue(job).await?;
        }
        info!("Submitted chord {}", workflow_id);
        Ok(workflow_id)
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> TaskResult<WorkflowStatus> {
        self.workflows
            .status(workflow_id)
            .await
            .ok_or_else(|| TaskError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    /// Per-lane statistics
    pub async fn queue_stats(&self, queue: &str) -> QueueStats {
        let now = Utc::now();
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..Default::default()
        };

        for entry in self.entries().await {
            let job = entry.lock().await;
            if job.queue != queue {
                continue;
            }
            match job.state {
                JobState::Pending if job.is_eligible(now) => stats.ready_jobs += 1,
                JobState::Pending => stats.delayed_jobs += 1,
                JobState::Assigned => stats.assigned_jobs += 1,
                JobState::Running => stats.running_jobs += 1,
                JobState::RetryScheduled => stats.retry_scheduled_jobs += 1,
                JobState::Succeeded => stats.succeeded_jobs += 1,
                JobState::Failed => stats.failed_jobs += 1,
            }
        }
        stats
    }

    /// Names of every lane jobs have been routed to
    pub async fn list_queues(&self) -> Vec<String> {
        self.lanes.lock().await.names()
    }

    /// Drop terminal jobs whose results expired, and expired results and workflows
    pub async fn collect_garbage(&self) -> TaskResult<u64> {
        let mut expired = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if self.is_expired(&job) {
                expired.push(job.id);
            }
        }

        if !expired.is_empty() {
            let mut jobs = self.jobs.write().await;
            for job_id in &expired {
                jobs.remove(job_id);
            }
        }
        for job_id in &expired {
            self.journal.remove(*job_id).await?;
        }

        let purged = self.results.purge_expired().await?;
        let cutoff = Utc::now() - self.config.result_ttl();
        let workflows = self.workflows.purge_finished(cutoff).await;

        let removed = expired.len() as u64;
        if removed > 0 || purged > 0 || workflows > 0 {
            info!(
                "Garbage-collected {} jobs, {} results, {} workflows",
                removed, purged, workflows
            );
        }
        Ok(removed)
    }

    /// Rebuild the job table from the journal.
    ///
    /// Jobs that were assigned or running when the previous broker stopped have
    /// lost their slot and go back to their lane, unless that was their last
    /// attempt; those fail as "worker lost".
    pub async fn recover(&self) -> TaskResult<usize> {
        let mut jobs = self.journal.load().await?;
        if jobs.is_empty() {
            return Ok(0);
        }
        jobs.sort_by_key(|job| job.created_at);

        let now = Utc::now();
        let mut requeued = 0;
        let mut lost = Vec::new();
        let count = jobs.len();
        for mut job in jobs {
            if job.state.is_in_flight() && job.attempts_exhausted() {
                let reason = format!(
                    "worker lost before restart (gave up after {} of {} attempts)",
                    job.attempt_count, job.max_attempts
                );
                job.mark_failed(&reason, now)?;
                self.journal.record(&job).await?;
                error!("Job {} ({}) failed: {}", job.id, job.name, reason);
                lost.push(job.clone());
            } else if job.state.is_in_flight() {
                job.requeue(now)?;
                self.journal.record(&job).await?;
                requeued += 1;
            }
            let (job_id, state, queue) = (job.id, job.state, job.queue.clone());
            self.jobs
                .write()
                .await
                .insert(job_id, Arc::new(Mutex::new(job)));
            match state {
                JobState::Pending => self.lanes.lock().await.push_back(&queue, job_id),
                JobState::RetryScheduled => self.mark_retrying(job_id).await,
                _ => {}
            }
        }

        if requeued > 0 || !lost.is_empty() {
            warn!(
                "Recovered {} jobs; {} in-flight jobs were requeued and {} had no attempts left",
                count,
                requeued,
                lost.len()
            );
        } else {
            info!("Recovered {} jobs from the journal", count);
        }
        self.notify.notify_waiters();

        for job in lost {
            self.finalize(job).await;
        }
        Ok(count)
    }
}
