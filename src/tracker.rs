//! Acknowledgement tracker: heartbeats, acks, failures and lease expiry.
//!
//! Every operation here checks that the caller's lease still owns the job
//! while holding the job's lock. Whichever of ack, failure and expiry gets
//! there first wins; the others see a stale lease and change nothing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::{JobError, TaskResult};
use crate::job::{Job, JobSpec, JobState, Progress};
use crate::lease::{Lease, LeaseStatus};
use crate::retry::RetryDecision;

/// Answer to `complete` and `fail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Accepted; the job moved to this state
    Acked(JobState),
    /// The lease no longer owns the job; nothing changed
    Stale,
}

impl AckOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, AckOutcome::Acked(_))
    }
}

/// What happened to a job whose lease ran out
pub(crate) enum Expiry {
    Requeued { queue: String },
    Failed(Job),
}

impl Broker {
    /// Renew a lease.
    ///
    /// A lease past its expiry is treated as lost even if the reaper has not
    /// run yet; the job is requeued on the spot.
    pub async fn heartbeat(&self, lease: &Lease) -> TaskResult<LeaseStatus> {
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
            self.after_expiry(lease, expiry).await;
            return Ok(LeaseStatus::Lost);
        }

        let ttl = self.config.lease_ttl();
        let expires_at = job.lease.as_mut().and_then(|held| {
            held.renew(ttl, now);
            held.expires_at
        });
        debug!("Heartbeat for job {} from slot {}", job.id, lease.slot);
        Ok(LeaseStatus::Active { expires_at })
    }

    /// Acknowledge successful completion
    pub async fn complete(&self, lease: &Lease, result: Value) -> TaskResult<AckOutcome> {
        let Some(entry) = self.entry(lease.job_id).await else {
            return Ok(AckOutcome::Stale);
        };
        let mut job = entry.lock().await;
        if !job.holds(lease) {
            info!("Ignoring completion of job {} from stale lease {}", lease.job_id, lease.id);
            return Ok(AckOutcome::Stale);
        }

        let now = Utc::now();
        if job.lease.as_ref().map_or(false, |l| l.is_expired(now)) {
            let expiry = self.expire_locked(&mut job, now).await?;
            drop(job);
            self.after_expiry(lease, expiry).await;
            return Ok(AckOutcome::Stale);
        }

        let mut next = job.clone();
        next.mark_success(result, now)?;
        self.journal.record(&next).await?;
        *job = next;
        let finished = job.clone();
        drop(job);

        info!(
            "Job {} ({}) succeeded on attempt {}",
            finished.id, finished.name, finished.attempt_count
        );
        self.release_slot(&lease.slot).await;
        self.finalize(finished).await;
        Ok(AckOutcome::Acked(JobState::Succeeded))
    }

    /// Report a failed attempt; the job's retry policy decides between a retry and `Failed`
    pub async fn fail(&self, lease: &Lease, err: JobError) -> TaskResult<AckOutcome> {
        let Some(entry) = self.entry(lease.job_id).await else {
            return Ok(AckOutcome::Stale);
        };
        let mut job = entry.lock().await;
        if !job.holds(lease) {
            info!("Ignoring failure of job {} from stale lease {}", lease.job_id, lease.id);
            return Ok(AckOutcome::Stale);
        }

        let now = Utc::now();
        if job.lease.as_ref().map_or(false, |l| l.is_expired(now)) {
            let expiry = self.expire_locked(&mut job, now).await?;
            drop(job);
            self.after_expiry(lease, expiry).await;
            return Ok(AckOutcome::Stale);
        }

        let decision = job.retry.decide(job.attempt_count, &err, now);
        let mut next = job.clone();
        match decision {
            RetryDecision::Retry { delay, not_before } => {
                next.schedule_retry(&err.to_string(), not_before, now)?;
                self.journal.record(&next).await?;
                *job = next;
                let job_id = job.id;
                drop(job);

                warn!(
                    "Job {} failed ({}); retrying in {}ms",
                    job_id,
                    err,
                    delay.num_milliseconds()
                );
                self.mark_retrying(job_id).await;
                self.release_slot(&lease.slot).await;
                Ok(AckOutcome::Acked(JobState::RetryScheduled))
            }
            RetryDecision::Fail { reason } => {
                next.mark_failed(&reason, now)?;
                self.journal.record(&next).await?;
                *job = next;
                let finished = job.clone();
                drop(job);

                error!("Job {} ({}) failed: {}", finished.id, finished.name, reason);
                self.release_slot(&lease.slot).await;
                self.finalize(finished).await;
                Ok(AckOutcome::Acked(JobState::Failed))
            }
        }
    }

    /// Record progress for a running job. Progress is best-effort and not journaled.
    pub async fn report_progress(&self, lease: &Lease, progress: Progress) -> TaskResult<LeaseStatus> {
        let Some(entry) = self.entry(lease.job_id).await else {
            return Ok(LeaseStatus::Lost);
        };
        let mut job = entry.lock().await;
        if !job.holds(lease) {
            return Ok(LeaseStatus::Lost);
        }
        job.progress = Some(progress);
        Ok(LeaseStatus::Active {
            expires_at: job.lease.as_ref().and_then(|l| l.expires_at),
        })
    }

    /// Force-expire `lease`, requeueing its job (or failing it when out of attempts).
    ///
    /// Returns `false` when the lease had already been acked, expired or superseded.
    pub async fn lease_expired(&self, lease: &Lease) -> TaskResult<bool> {
        let Some(entry) = self.entry(lease.job_id).await else {
            return Ok(false);
        };
        let mut job = entry.lock().await;
        if !job.holds(lease) {
            return Ok(false);
        }
        let expiry = self.expire_locked(&mut job, Utc::now()).await?;
        drop(job);
        self.after_expiry(lease, expiry).await;
        Ok(true)
    }

    /// Expire every lease past its deadline; returns how many were reaped
    pub async fn reap_expired_leases(&self) -> TaskResult<usize> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in self.entries().await {
            let job = entry.lock().await;
            if let Some(lease) = job.lease.as_ref().filter(|_| job.state.is_in_flight()) {
                if lease.is_expired(now) {
                    expired.push(lease.clone());
                }
            }
        }

        let mut reaped = 0;
        for lease in expired {
            if self.lease_expired(&lease).await? {
                reaped += 1;
            }
        }
        if reaped > 0 {
            warn!("Reaped {} expired leases", reaped);
        }
        Ok(reaped)
    }

    /// Apply lease loss to a locked, in-flight job
    pub(crate) async fn expire_locked(&self, job: &mut Job, now: DateTime<Utc>) -> TaskResult<Expiry> {
        let mut next = job.clone();
        let slot = job.lease.as_ref().map(|l| l.slot.clone()).unwrap_or_default();

        if job.attempts_exhausted() {
            let reason = format!(
                "worker lost on slot {} (gave up after {} of {} attempts)",
                slot, job.attempt_count, job.max_attempts
            );
            next.mark_failed(&reason, now)?;
            self.journal.record(&next).await?;
            *job = next;
            error!("Job {} ({}) failed: {}", job.id, job.name, reason);
            return Ok(Expiry::Failed(job.clone()));
        }

        next.requeue(now)?;
        self.journal.record(&next).await?;
        *job = next;
        warn!(
            "Lease on job {} expired (slot {}); requeued after attempt {}",
            job.id, slot, job.attempt_count
        );
        Ok(Expiry::Requeued {
            queue: job.queue.clone(),
        })
    }

    pub(crate) async fn after_expiry(&self, lease: &Lease, expiry: Expiry) {
        self.release_slot(&lease.slot).await;
        match expiry {
            Expiry::Requeued { queue } => self.push_ready(&queue, lease.job_id).await,
            Expiry::Failed(job) => self.finalize(job).await,
        }
    }

    /// Store the outcome of a terminal job and start whatever it unblocks.
    ///
    /// The job's own transition is already committed when this runs, so
    /// nothing here fails the caller. A continuation that cannot be enqueued
    /// is parked for [`Broker::retry_continuations`].
    pub(crate) async fn finalize(&self, job: Job) {
        let mut finished = VecDeque::from([job]);

        while let Some(job) = finished.pop_front() {
            if let Some(outcome) = job.outcome() {
                if let Err(e) = self.results.store(&outcome, self.config.result_ttl()).await {
                    error!("Failed to store result of job {}: {}", job.id, e);
                }
            }

            let (callbacks, upstream) = match job.state {
                JobState::Succeeded => (&job.links, job.result.clone().unwrap_or(Value::Null)),
                _ => (
                    &job.error_links,
                    json!({ "job_id": job.id, "error": job.error }),
                ),
            };
            for spec in callbacks {
                let payload = spec.linked_payload(upstream.clone());
                let callback = self
                    .build_job(JobSpec { payload, ..spec.clone() })
                    .with_dependencies(vec![job.id]);
                debug!("Job {} triggers callback {} ({})", job.id, callback.id, callback.name);
                self.dispatch(callback, &mut finished).await;
            }

            match self.workflows.on_job_finished(&job).await {
                Ok(next) => {
                    for next in next {
                        self.dispatch(next, &mut finished).await;
                    }
                }
                Err(e) => error!("Failed to advance workflow of job {}: {}", job.id, e),
            }
        }
    }

    /// Hand a continuation to the dispatcher, or park it when that fails.
    ///
    /// Terminal continuations (a chord reducer failed without running) are
    /// pushed onto `finished` so their own outcome is processed.
    async fn dispatch(&self, job: Job, finished: &mut VecDeque<Job>) -> bool {
        let placed = if job.is_terminal() {
            self.insert_finished(job.clone()).await
        } else {
            self.enqueue(job.clone()).await.map(|_| ())
        };

        match placed {
            Ok(()) => {
                if job.is_terminal() {
                    finished.push_back(job);
                }
                true
            }
            Err(e) => {
                warn!("Parking job {} ({}) for a later retry: {}", job.id, job.name, e);
                self.continuations.lock().await.push(job);
                false
            }
        }
    }

    /// Retry continuations parked by a failed enqueue; returns how many were placed
    pub async fn retry_continuations(&self) -> usize {
        let parked = std::mem::take(&mut *self.continuations.lock().await);
        if parked.is_empty() {
            return 0;
        }

        let mut finished = VecDeque::new();
        let mut placed = 0;
        for job in parked {
            if self.dispatch(job, &mut finished).await {
                placed += 1;
            }
        }
        for job in finished {
            self.finalize(job).await;
        }

        if placed > 0 {
            info!("Placed {} parked continuation jobs", placed);
        }
        placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::results::ResultLookup;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    fn broker() -> Broker {
        let config = BrokerConfig {
            jitter: false,
            base_backoff_seconds: 0.0,
            ..Default::default()
        };
        Broker::new(config).unwrap()
    }

    async fn claim_one(broker: &Broker, slot: &str) -> Lease {
        broker
            .claim(slot, &["default"], 1)
            .await
            .unwrap()
            .expect("job available")
            .lease
    }

    #[tokio::test]
    async fn completion_is_first_writer_wins() {
        let broker = broker();
        let id = broker.submit(JobSpec::new("add", json!([1, 2]))).await.unwrap();
        let lease = claim_one(&broker, "a").await;
        broker.start(&lease).await.unwrap();

        let first = broker.complete(&lease, json!(3)).await.unwrap();
        let second = broker.fail(&lease, JobError::permanent("late")).await.unwrap();
        assert_eq!(first, AckOutcome::Acked(JobState::Succeeded));
        assert_eq!(second, AckOutcome::Stale);

        let state = broker.get_state(id).await.unwrap();
        assert_eq!(state.state, Some(JobState::Succeeded));
        assert_eq!(state.result, Some(json!(3)));
        assert_eq!(broker.held_by("a").await, 0);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_then_requeues() {
        let broker = broker();
        let id = broker.submit(JobSpec::new("flaky", Value::Null)).await.unwrap();
        let lease = claim_one(&broker, "a").await;

        let outcome = broker.fail(&lease, JobError::transient("busy")).await.unwrap();
        assert_eq!(outcome, AckOutcome::Acked(JobState::RetryScheduled));
        assert_eq!(broker.promote_due_retries().await.unwrap(), 1);

        let retry = claim_one(&broker, "b").await;
        assert_eq!(retry.job_id, id);
        assert_eq!(broker.get_state(id).await.unwrap().attempt_count, 2);
    }

    #[tokio::test]
    async fn permanent_failure_runs_error_callback() {
        let broker = broker();
        let errback = JobSpec::new("on_error", Value::Null).on_queue("errors");
        let id = broker
            .submit(JobSpec::new("div", json!([1, 0])).link_error(errback))
            .await
            .unwrap();
        let lease = claim_one(&broker, "a").await;
        broker
            .fail(&lease, JobError::permanent("division by zero"))
            .await
            .unwrap();

        let claim = broker.claim("a", &["errors"], 1).await.unwrap().unwrap();
        assert_eq!(claim.job.name, "on_error");
        assert_eq!(claim.job.payload["job_id"], json!(id));
        assert!(claim.job.payload["error"]
            .as_str()
            .unwrap()
            .contains("division by zero"));
    }

    #[tokio::test]
    async fn heartbeat_renews_and_detects_expiry() {
        let config = BrokerConfig {
            lease_ttl_seconds: 0.05,
            ..Default::default()
        };
        let broker = Broker::new(config).unwrap();
        let id = broker.submit(JobSpec::new("slow", Value::Null)).await.unwrap();
        let lease = claim_one(&broker, "a").await;

        assert!(broker.heartbeat(&lease).await.unwrap().is_active());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.heartbeat(&lease).await.unwrap(), LeaseStatus::Lost);

        let state = broker.get_state(id).await.unwrap();
        assert_eq!(state.state, Some(JobState::Pending));
        assert_eq!(broker.complete(&lease, json!(1)).await.unwrap(), AckOutcome::Stale);
    }

    #[tokio::test]
    async fn expiry_on_last_attempt_fails_the_job() {
        let broker = broker();
        let spec = JobSpec::new("crashy", Value::Null)
            .with_retry(RetryPolicy::default().with_max_attempts(1));
        let id = broker.submit(spec).await.unwrap();
        let lease = claim_one(&broker, "a").await;

        assert!(broker.lease_expired(&lease).await.unwrap());
        assert!(!broker.lease_expired(&lease).await.unwrap());

        match broker.get_result(id).await.unwrap() {
            ResultLookup::Ready(outcome) => {
                assert_eq!(outcome.state, JobState::Failed);
                assert!(outcome.error.unwrap().contains("worker lost"));
            }
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    #[tokio::test]
    async fn progress_is_visible_through_status() {
        let broker = broker();
        let id = broker.submit(JobSpec::new("long", Value::Null)).await.unwrap();
        let lease = claim_one(&broker, "a").await;
        broker.start(&lease).await.unwrap();
        broker
            .report_progress(&lease, Progress::new(3, 10))
            .await
            .unwrap();

        let state = broker.get_state(id).await.unwrap();
        assert_eq!(state.state, Some(JobState::Running));
        assert_eq!(state.progress, Some(Progress::new(3, 10)));
    }
}
