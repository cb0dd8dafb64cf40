//! Broker configuration

use serde::Deserialize;

use crate::error::{TaskError, TaskResult};
use crate::retry::RetryPolicy;

/// Environment variable prefix read by [`BrokerConfig::from_env`]
pub const ENV_PREFIX: &str = "TASKLANE_";

/// Longest TTL or backoff accepted, in seconds (ten years)
pub const MAX_DURATION_SECONDS: f64 = 10.0 * 365.0 * 86400.0;

/// Configuration for the broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Lane used when a job names none
    pub default_queue: String,
    /// Default cap on execution attempts per job
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds
    pub base_backoff_seconds: f64,
    /// Upper bound on a single backoff delay, in seconds
    pub max_backoff_seconds: f64,
    /// Randomize each backoff delay uniformly in `[0, delay]`
    pub jitter: bool,
    /// Acknowledge on completion instead of on claim.
    ///
    /// Turning this off means a worker crash loses the jobs it held.
    pub acks_late: bool,
    /// Jobs a slot may hold assigned before it completes any of them
    pub prefetch_multiplier: u32,
    /// How long terminal results are kept, in seconds
    pub result_ttl_seconds: f64,
    /// Lease lifetime without a heartbeat, in seconds
    pub lease_ttl_seconds: f64,
    /// Upper bound on how long an idle poll sleeps before rechecking, in milliseconds
    pub poll_interval_ms: u64,
    /// Redis URL for the persistent result backend and journal, if any
    pub redis_url: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            max_attempts: 3,
            base_backoff_seconds: 1.0,
            max_backoff_seconds: 600.0,
            jitter: true,
            acks_late: true,
            prefetch_multiplier: 1,
            result_ttl_seconds: 86400.0, // 24 hours
            lease_ttl_seconds: 30.0,
            poll_interval_ms: 200,
            redis_url: None,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from `TASKLANE_*` environment variables (and a `.env` file)
    pub fn from_env() -> TaskResult<Self> {
        dotenvy::dotenv().ok();
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| TaskError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the broker cannot run with
    pub fn validate(&self) -> TaskResult<()> {
        if self.max_attempts == 0 {
            return Err(TaskError::config("max_attempts must be at least 1"));
        }
        if self.prefetch_multiplier == 0 {
            return Err(TaskError::config("prefetch_multiplier must be at least 1"));
        }
        for (name, value) in [
            ("base_backoff_seconds", self.base_backoff_seconds),
            ("max_backoff_seconds", self.max_backoff_seconds),
            ("lease_ttl_seconds", self.lease_ttl_seconds),
            ("result_ttl_seconds", self.result_ttl_seconds),
        ] {
            if !value.is_finite() || value > MAX_DURATION_SECONDS {
                return Err(TaskError::config(format!(
                    "{} must be a finite number of seconds no larger than {}",
                    name, MAX_DURATION_SECONDS
                )));
            }
        }
        if self.base_backoff_seconds < 0.0 || self.max_backoff_seconds < 0.0 {
            return Err(TaskError::config("backoff must not be negative"));
        }
        if self.base_backoff_seconds > self.max_backoff_seconds {
            return Err(TaskError::config(
                "base_backoff_seconds must not exceed max_backoff_seconds",
            ));
        }
        if self.lease_ttl_seconds <= 0.0 {
            return Err(TaskError::config("lease_ttl_seconds must be positive"));
        }
        if self.result_ttl_seconds <= 0.0 {
            return Err(TaskError::config("result_ttl_seconds must be positive"));
        }
        if self.default_queue.is_empty() {
            return Err(TaskError::config("default_queue must not be empty"));
        }
        Ok(())
    }

    /// Retry policy applied to jobs that do not carry their own
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_backoff(
                seconds(self.base_backoff_seconds),
                seconds(self.max_backoff_seconds),
            )
            .with_jitter(self.jitter)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        seconds(self.lease_ttl_seconds)
    }

    pub fn result_ttl(&self) -> chrono::Duration {
        seconds(self.result_ttl_seconds)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Convert fractional seconds into a chrono duration with millisecond precision
pub(crate) fn seconds(value: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((value * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.prefetch_multiplier, 1);
        assert!(config.acks_late);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = BrokerConfig {
            base_backoff_seconds: 10.0,
            max_backoff_seconds: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TaskError::Config { .. })));
    }

    #[test]
    fn rejects_zero_prefetch() {
        let config = BrokerConfig {
            prefetch_multiplier: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_durations_that_would_overflow_timestamps() {
        let config = BrokerConfig {
            result_ttl_seconds: 1e300,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TaskError::Config { .. })));

        let config = BrokerConfig {
            lease_ttl_seconds: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BrokerConfig {
            result_ttl_seconds: MAX_DURATION_SECONDS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fractional_seconds_keep_millisecond_precision() {
        assert_eq!(seconds(0.25), chrono::Duration::milliseconds(250));
    }

    struct WarnCounter(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn at_most_once_warning_is_logged_once_per_broker() {
        use tracing_subscriber::layer::SubscriberExt;

        let warnings = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(WarnCounter(warnings.clone()));
        let config = BrokerConfig {
            acks_late: false,
            ..Default::default()
        };

        tracing::subscriber::with_default(subscriber, || {
            assert!(config.validate().is_ok());
            assert!(crate::Broker::new(config.clone()).is_ok());
        });
        assert_eq!(warnings.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
