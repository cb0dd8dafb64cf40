//! Retry policy: classifies job failures and computes backoff

use chrono::{DateTime, Duration, Utc};
use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::deadline_after;

/// Configuration for job retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds
    pub base_backoff_ms: u64,
    /// Maximum delay between attempts in milliseconds
    pub max_backoff_ms: u64,
    /// Whether to randomize each delay uniformly in `[0, delay]`
    pub jitter: bool,
    /// Codes of [`JobError::Raised`] failures that are worth retrying
    pub transient_codes: Vec<String>,
    /// Treat time-limit failures as permanent instead of transient
    pub timeouts_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 600_000, // 10 minutes
            jitter: true,
            transient_codes: Vec::new(),
            timeouts_permanent: false,
        }
    }
}

/// How a failure is treated by the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    /// Caller asked for a retry after a fixed countdown
    Manual(Duration),
}

/// Outcome of [`RetryPolicy::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt no earlier than `not_before`
    Retry {
        delay: Duration,
        not_before: DateTime<Utc>,
    },
    /// Give up; the job is permanently failed
    Fail { reason: String },
}

impl RetryPolicy {
    /// Set the backoff bounds from chrono durations
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff_ms = base.num_milliseconds().max(0) as u64;
        self.max_backoff_ms = max.num_milliseconds().max(0) as u64;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Mark a raised error code as transient
    pub fn retry_on<S: Into<String>>(mut self, code: S) -> Self {
        self.transient_codes.push(code.into());
        self
    }

    pub fn classify(&self, error: &JobError) -> ErrorClass {
        match error {
            JobError::Transient(_) => ErrorClass::Transient,
            JobError::Permanent(_) => ErrorClass::Permanent,
            JobError::Timeout { .. } if self.timeouts_permanent => ErrorClass::Permanent,
            JobError::Timeout { .. } => ErrorClass::Transient,
            JobError::Retry { countdown, .. } => ErrorClass::Manual(
                Duration::from_std(*countdown)
                    .unwrap_or_else(|_| Duration::milliseconds(self.max_backoff_ms as i64)),
            ),
            JobError::Raised { code, .. } => {
                if self.transient_codes.iter().any(|c| c == code) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
        }
    }

    /// Un-jittered delay after the given attempt: `min(base * 2^attempt, max)`
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt_count).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::milliseconds(delay_ms.min(i64::MAX as u64) as i64)
    }

    /// Delay actually applied, with jitter if enabled
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let delay = self.backoff(attempt_count);
        if !self.jitter {
            return delay;
        }
        let ceiling = delay.num_milliseconds().max(0);
        let mut rng = rand::rng();
        Duration::milliseconds(rng.random_range(0..=ceiling))
    }

    /// Decide what happens to a job that failed on its `attempt_count`-th attempt
    pub fn decide(&self, attempt_count: u32, error: &JobError, now: DateTime<Utc>) -> RetryDecision {
        let delay = match self.classify(error) {
            ErrorClass::Permanent => {
                return RetryDecision::Fail {
                    reason: error.to_string(),
                }
            }
            ErrorClass::Transient => self.next_delay(attempt_count),
            ErrorClass::Manual(countdown) => countdown,
        };

        if attempt_count >= self.max_attempts {
            return RetryDecision::Fail {
                reason: format!(
                    "{} (gave up after {} of {} attempts)",
                    error, attempt_count, self.max_attempts
                ),
            };
        }

        RetryDecision::Retry {
            delay,
            not_before: deadline_after(now, delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = policy();
        let delays: Vec<i64> = (0..8).map(|a| policy.backoff(a).num_milliseconds()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000, 1_000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backoff_saturates_on_large_attempt_counts() {
        let policy = policy();
        assert_eq!(policy.backoff(200).num_milliseconds(), 1_000);
    }

    #[test]
    fn jittered_delay_stays_within_computed_delay() {
        let policy = policy().with_jitter(true);
        for attempt in 0..6 {
            let ceiling = policy.backoff(attempt);
            for _ in 0..50 {
                let delay = policy.next_delay(attempt);
                assert!(delay >= Duration::zero());
                assert!(delay <= ceiling, "{:?} > {:?}", delay, ceiling);
            }
        }
    }

    #[test]
    fn transient_failure_is_retried_until_attempts_run_out() {
        let policy = policy();
        let now = Utc::now();
        let err = JobError::transient("connection reset");

        match policy.decide(1, &err, now) {
            RetryDecision::Retry { delay, not_before } => {
                assert_eq!(delay, Duration::milliseconds(200));
                assert_eq!(not_before, now + delay);
            }
            other => panic!("expected retry, got {:?}", other),
        }
        assert!(matches!(policy.decide(5, &err, now), RetryDecision::Fail { .. }));
    }

    #[test]
    fn permanent_failure_is_never_retried() {
        let decision = policy().decide(1, &JobError::permanent("bad input"), Utc::now());
        assert!(matches!(decision, RetryDecision::Fail { .. }));
    }

    #[test]
    fn manual_retry_uses_the_countdown() {
        let err = JobError::retry_in("rate limited", std::time::Duration::from_secs(42));
        match policy().decide(1, &err, Utc::now()) {
            RetryDecision::Retry { delay, .. } => assert_eq!(delay, Duration::seconds(42)),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn raised_codes_follow_the_allowlist() {
        let policy = policy().retry_on("ECONNREFUSED");
        assert_eq!(
            policy.classify(&JobError::raised("ECONNREFUSED", "refused")),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&JobError::raised("EINVAL", "bad")),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn timeouts_are_transient_unless_marked_permanent() {
        let err = JobError::hard_timeout("slow");
        assert_eq!(policy().classify(&err), ErrorClass::Transient);

        let strict = RetryPolicy {
            timeouts_permanent: true,
            ..policy()
        };
        assert_eq!(strict.classify(&err), ErrorClass::Permanent);
    }
}
