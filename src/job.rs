//! Job definitions and state transitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug};
use uuid::Uuid;

use crate::error::{JobError, TaskError, TaskResult};
use crate::lease::Lease;
use crate::results::JobOutcome;
use crate::retry::RetryPolicy;
use crate::workflow::WorkflowId;

/// Unique identifier for jobs
pub type JobId = Uuid;

/// `now + delay`, clamped to the latest representable instant instead of overflowing
pub(crate) fn deadline_after(now: DateTime<Utc>, delay: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Waiting in its lane to be claimed
    Pending,
    /// Claimed by a worker slot, not yet started
    Assigned,
    /// Executing on a worker slot
    Running,
    /// Failed transiently, waiting for its backoff to elapse
    RetryScheduled,
    /// Completed successfully
    Succeeded,
    /// Failed permanently
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Owned by a lease
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Assigned => "ASSIGNED",
            JobState::Running => "RUNNING",
            JobState::RetryScheduled => "RETRY_SCHEDULED",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Whether a job continuing a workflow receives the upstream result
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Linkage {
    /// Upstream result is merged into the payload
    #[default]
    Mutable,
    /// Payload is used as given
    Immutable,
}

/// Best-effort progress reported by the running job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            current,
            total,
            meta: None,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

/// Typed job that knows how to run itself.
///
/// Register one with [`crate::worker::Worker::register_task`]; its payload is the
/// JSON form of the value and its result the JSON form of `Output`.
#[async_trait]
pub trait Task: Send + Sync + Debug + Serialize + DeserializeOwned {
    /// The output type of the task
    type Output: Serialize + Send;

    /// Execute the task and return the result
    async fn execute(&self) -> Result<Self::Output, JobError>;

    /// Handler name used for routing (defaults to the type name)
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Retry policy overriding the broker default
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Everything a producer supplies to create a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    /// Handler name
    pub name: String,
    /// Opaque arguments
    pub payload: Value,
    /// Target lane; empty means the broker's default queue
    pub queue: String,
    /// Retry policy overriding the broker default
    pub retry: Option<RetryPolicy>,
    /// Do not run before this instant
    pub eta: Option<DateTime<Utc>>,
    /// Do not run before this long after submission
    pub countdown_ms: Option<u64>,
    pub linkage: Linkage,
    /// Enqueued with this job's result when it succeeds
    pub links: Vec<JobSpec>,
    /// Enqueued with this job's error when it fails permanently
    pub error_links: Vec<JobSpec>,
}

impl JobSpec {
    pub fn new<S: Into<String>>(name: S, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            queue: String::new(),
            retry: None,
            eta: None,
            countdown_ms: None,
            linkage: Linkage::Mutable,
            links: Vec::new(),
            error_links: Vec::new(),
        }
    }

    /// Build a spec from a typed task
    pub fn from_task<T: Task>(task: &T) -> TaskResult<Self> {
        let mut spec = Self::new(task.name(), serde_json::to_value(task)?);
        spec.retry = task.retry_policy();
        Ok(spec)
    }

    pub fn on_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn countdown(mut self, countdown: std::time::Duration) -> Self {
        self.countdown_ms = Some(u64::try_from(countdown.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Ignore upstream results when used inside a chain or as a callback
    pub fn immutable(mut self) -> Self {
        self.linkage = Linkage::Immutable;
        self
    }

    pub fn link(mut self, callback: JobSpec) -> Self {
        self.links.push(callback);
        self
    }

    pub fn link_error(mut self, errback: JobSpec) -> Self {
        self.error_links.push(errback);
        self
    }

    /// Payload this spec runs with when continuing from `upstream`.
    ///
    /// Mutable linkage puts the upstream value first: a null payload becomes the
    /// value itself, an array payload gets it prepended, anything else becomes
    /// `[upstream, payload]`.
    pub fn linked_payload(&self, upstream: Value) -> Value {
        if self.linkage == Linkage::Immutable {
            return self.payload.clone();
        }
        match &self.payload {
            Value::Null => upstream,
            Value::Array(items) => {
                let mut merged = Vec::with_capacity(items.len() + 1);
                merged.push(upstream);
                merged.extend(items.iter().cloned());
                Value::Array(merged)
            }
            other => Value::Array(vec![upstream, other.clone()]),
        }
    }
}

/// A job as tracked by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: Value,
    pub queue: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    pub not_before: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Jobs whose success this job waited for
    pub dependencies: Vec<JobId>,
    pub lease: Option<Lease>,
    pub progress: Option<Progress>,
    pub workflow: Option<WorkflowId>,
    pub links: Vec<JobSpec>,
    pub error_links: Vec<JobSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job from a spec, resolving defaults
    pub fn from_spec(
        spec: JobSpec,
        default_queue: &str,
        default_retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let retry = spec.retry.unwrap_or_else(|| default_retry.clone());
        let queue = if spec.queue.is_empty() {
            default_queue.to_string()
        } else {
            spec.queue
        };
        let countdown = spec
            .countdown_ms
            .map(|ms| {
                let ms = i64::try_from(ms).unwrap_or(i64::MAX);
                deadline_after(now, chrono::Duration::milliseconds(ms))
            });
        let not_before = match (spec.eta, countdown) {
            (Some(eta), Some(countdown)) => Some(eta.max(countdown)),
            (eta, countdown) => eta.or(countdown),
        };

        Self {
            id: JobId::new_v4(),
            name: spec.name,
            payload: spec.payload,
            queue,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts: retry.max_attempts.max(1),
            retry,
            not_before,
            result: None,
            error: None,
            dependencies: Vec::new(),
            lease: None,
            progress: None,
            workflow: None,
            links: spec.links,
            error_links: spec.error_links,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<JobId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn in_workflow(mut self, workflow: WorkflowId) -> Self {
        self.workflow = Some(workflow);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pending and past its `not_before`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// Whether `lease` is the one currently owning this job
    pub fn holds(&self, lease: &Lease) -> bool {
        self.state.is_in_flight() && self.lease.as_ref().map(|l| l.id) == Some(lease.id)
    }

    fn transition_error(&self, to: JobState) -> TaskError {
        TaskError::InvalidTransition {
            job_id: self.id.to_string(),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    fn touch(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
    }

    /// Every allowed attempt has been handed out
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// `Pending -> Assigned`, counting a new attempt.
    ///
    /// Refused once the job has used all of its attempts.
    pub fn assign(&mut self, lease: Lease, now: DateTime<Utc>) -> TaskResult<()> {
        if self.state != JobState::Pending || self.attempts_exhausted() {
            return Err(self.transition_error(JobState::Assigned));
        }
        self.attempt_count += 1;
        self.lease = Some(lease);
        self.touch(JobState::Assigned, now);
        Ok(())
    }

    /// `Assigned -> Running`
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> TaskResult<()> {
        match self.state {
            JobState::Assigned => {
                self.started_at = Some(now);
                self.touch(JobState::Running, now);
                Ok(())
            }
            JobState::Running => Ok(()),
            _ => Err(self.transition_error(JobState::Running)),
        }
    }

    pub fn mark_success(&mut self, result: Value, now: DateTime<Utc>) -> TaskResult<()> {
        if self.is_terminal() {
            return Err(self.transition_error(JobState::Succeeded));
        }
        self.result = Some(result);
        self.error = None;
        self.lease = None;
        self.not_before = None;
        self.finished_at = Some(now);
        self.touch(JobState::Succeeded, now);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) -> TaskResult<()> {
        if self.is_terminal() {
            return Err(self.transition_error(JobState::Failed));
        }
        self.error = Some(error.to_string());
        self.lease = None;
        self.not_before = None;
        self.finished_at = Some(now);
        self.touch(JobState::Failed, now);
        Ok(())
    }

    /// `Assigned|Running -> RetryScheduled`
    pub fn schedule_retry(
        &mut self,
        error: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TaskResult<()> {
        if !self.state.is_in_flight() {
            return Err(self.transition_error(JobState::RetryScheduled));
        }
        self.error = Some(error.to_string());
        self.lease = None;
        self.started_at = None;
        self.not_before = Some(not_before);
        self.touch(JobState::RetryScheduled, now);
        Ok(())
    }

    /// `RetryScheduled -> Pending` once the backoff has elapsed.
    ///
    /// Returns whether the job was promoted.
    pub fn promote_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::RetryScheduled || self.not_before.map_or(false, |t| t > now) {
            return false;
        }
        self.touch(JobState::Pending, now);
        true
    }

    /// `Assigned|Running -> Pending` after the owning lease was lost
    pub fn requeue(&mut self, now: DateTime<Utc>) -> TaskResult<()> {
        if !self.state.is_in_flight() {
            return Err(self.transition_error(JobState::Pending));
        }
        self.lease = None;
        self.started_at = None;
        self.progress = None;
        self.touch(JobState::Pending, now);
        Ok(())
    }

    /// Terminal outcome, if the job has one
    pub fn outcome(&self) -> Option<JobOutcome> {
        if !self.is_terminal() {
            return None;
        }
        Some(JobOutcome {
            job_id: self.id,
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
            attempts: self.attempt_count,
            finished_at: self.finished_at.unwrap_or(self.updated_at),
        })
    }
}
