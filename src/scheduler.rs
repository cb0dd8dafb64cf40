//! Housekeeping loops that keep the broker moving without worker involvement

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::error::TaskResult;

/// How often each housekeeping duty runs
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Interval for promoting due retries and reaping expired leases
    pub sweep_interval: Duration,
    /// Interval for dropping expired results and finished workflows
    pub gc_interval: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            gc_interval: Duration::from_secs(3600), // every hour
        }
    }
}

/// What a single sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub retries_promoted: usize,
    pub leases_reaped: usize,
    /// Parked continuation jobs that were enqueued on this sweep
    pub continuations_placed: usize,
}

/// Housekeeper statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HousekeeperStats {
    pub sweeps: u64,
    pub retries_promoted: u64,
    pub leases_reaped: u64,
    pub continuations_placed: u64,
    pub jobs_collected: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

/// Periodically promotes due retries, reaps expired leases and collects garbage
pub struct Housekeeper {
    broker: Arc<Broker>,
    config: HousekeeperConfig,
    stats: Arc<Mutex<HousekeeperStats>>,
    shutdown_signal: Arc<RwLock<bool>>,
}

impl Housekeeper {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self::with_config(broker, HousekeeperConfig::default())
    }

    pub fn with_config(broker: Arc<Broker>, config: HousekeeperConfig) -> Self {
        Self {
            broker,
            config,
            stats: Arc::new(Mutex::new(HousekeeperStats::default())),
            shutdown_signal: Arc::new(RwLock::new(false)),
        }
    }

    /// Run one sweep: place parked continuations, promote due retries, then reap expired leases
    pub async fn run_once(&self) -> TaskResult<SweepReport> {
        Self::sweep(&self.broker, &self.stats).await
    }

    async fn sweep(
        broker: &Broker,
        stats: &Mutex<HousekeeperStats>,
    ) -> TaskResult<SweepReport> {
        let continuations_placed = broker.retry_continuations().await;
        let report = SweepReport {
            retries_promoted: broker.promote_due_retries().await?,
            leases_reaped: broker.reap_expired_leases().await?,
            continuations_placed,
        };

        let mut stats = stats.lock().await;
        stats.sweeps += 1;
        stats.retries_promoted += report.retries_promoted as u64;
        stats.leases_reaped += report.leases_reaped as u64;
        stats.continuations_placed += report.continuations_placed as u64;
        stats.last_sweep = Some(Utc::now());
        Ok(report)
    }

    /// Spawn the housekeeping loops; they stop after [`Housekeeper::shutdown`]
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let broker = self.broker.clone();
        let stats = self.stats.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let config = self.config.clone();

        info!(
            "Starting housekeeper (sweep every {:?}, gc every {:?})",
            config.sweep_interval, config.gc_interval
        );

        tokio::spawn(async move {
            let mut sweep_timer = interval(config.sweep_interval);
            let mut gc_timer = interval(config.gc_interval);

            loop {
                tokio::select! {
                    _ = sweep_timer.tick() => {
                        if *shutdown_signal.read().await {
                            break;
                        }
                        match Self::sweep(&broker, &stats).await {
                            Ok(report) if report != SweepReport::default() => {
                                debug!("Housekeeping sweep: {:?}", report);
                            }
                            Ok(_) => {}
                            Err(e) => error!("Housekeeping sweep failed: {}", e),
                        }
                    }
                    _ = gc_timer.tick() => {
                        if *shutdown_signal.read().await {
                            break;
                        }
                        match broker.collect_garbage().await {
                            Ok(collected) => stats.lock().await.jobs_collected += collected,
                            Err(e) => error!("Garbage collection failed: {}", e),
                        }
                    }
                }
            }

            info!("Housekeeper stopped");
        })
    }

    /// Signal the loops to stop at their next tick
    pub async fn shutdown(&self) {
        info!("Shutting down housekeeper");
        let mut shutdown = self.shutdown_signal.write().await;
        *shutdown = true;
    }

    pub async fn get_stats(&self) -> HousekeeperStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::error::JobError;
    use crate::job::{JobSpec, JobState};
    use serde_json::Value;

    #[tokio::test]
    async fn sweep_promotes_retries_and_reaps_leases() {
        let config = BrokerConfig {
            jitter: false,
            base_backoff_seconds: 0.0,
            lease_ttl_seconds: 0.02,
            ..Default::default()
        };
        let broker = Arc::new(Broker::new(config).unwrap());
        let housekeeper = Housekeeper::new(broker.clone());

        let retried = broker.submit(JobSpec::new("flaky", Value::Null)).await.unwrap();
        let abandoned = broker.submit(JobSpec::new("crash", Value::Null)).await.unwrap();
        let claims = broker
            .try_claim("a", &["default"], 2, 2)
            .await
            .unwrap();
        assert_eq!(claims.len(), 2);
        let failing = claims.iter().find(|c| c.job.id == retried).unwrap();
        broker
            .fail(&failing.lease, JobError::transient("busy"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = housekeeper.run_once().await.unwrap();
        assert_eq!(report.retries_promoted, 1);
        assert_eq!(report.leases_reaped, 1);

        for id in [retried, abandoned] {
            let state = broker.get_state(id).await.unwrap();
            assert_eq!(state.state, Some(JobState::Pending));
        }
        assert_eq!(housekeeper.get_stats().await.sweeps, 1);
    }
}
