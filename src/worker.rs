//! Worker runtime: slots that claim jobs from the broker and run their handlers

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Claim};
use crate::error::{JobError, TaskError, TaskResult};
use crate::job::{Job, JobId, JobState, Progress, Task};
use crate::lease::{Lease, LeaseStatus};
use crate::scheduler::Housekeeper;
use crate::tracker::AckOutcome;

/// Unique identifier for workers
pub type WorkerId = Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier
    pub worker_id: WorkerId,
    /// Queues this worker consumes, in priority order
    pub queues: Vec<String>,
    /// Number of slots executing jobs concurrently
    pub concurrency: usize,
    /// How long an idle slot waits for work before rechecking for shutdown, in milliseconds
    pub poll_timeout_ms: u64,
    /// Soft time limit per execution in milliseconds. When it passes the handler is
    /// signalled through [`JobContext::soft_limit_reached`] and an error it then
    /// returns is reported as a soft timeout.
    pub soft_time_limit_ms: Option<u64>,
    /// Hard time limit per execution in milliseconds; the handler is cancelled when it runs out
    pub hard_time_limit_ms: Option<u64>,
    /// Lease renewal interval in milliseconds; keep it well under the broker's lease TTL
    pub heartbeat_interval_ms: u64,
    /// Worker shutdown grace period in seconds
    pub shutdown_grace_period: u64,
    /// Also run the broker's housekeeping loops in this worker
    pub run_housekeeping: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new_v4(),
            queues: vec!["default".to_string()],
            concurrency: 4,
            poll_timeout_ms: 1000,
            soft_time_limit_ms: None,
            hard_time_limit_ms: Some(300_000), // 5 minutes
            heartbeat_interval_ms: 10_000,
            shutdown_grace_period: 30,
            run_housekeeping: true,
        }
    }
}

impl WorkerConfig {
    fn slot_id(&self, index: usize) -> String {
        format!("{}:{}", self.worker_id, index)
    }
}

/// Worker statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    /// Executions whose lease was lost before they could be acknowledged
    pub jobs_abandoned: u64,
    pub average_execution_time_ms: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl WorkerStats {
    fn record_execution(&mut self, elapsed: Duration) {
        self.jobs_processed += 1;
        let elapsed_ms = elapsed.as_millis() as f64;
        self.average_execution_time_ms = if self.jobs_processed == 1 {
            elapsed_ms
        } else {
            (self.average_execution_time_ms * (self.jobs_processed - 1) as f64 + elapsed_ms)
                / self.jobs_processed as f64
        };
    }
}

/// What a running job can see and do
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Job,
    lease: Lease,
    broker: Arc<Broker>,
    soft_limit: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, lease: Lease, broker: Arc<Broker>) -> Self {
        Self {
            job,
            lease,
            broker,
            soft_limit: CancellationToken::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// Attempt number of this execution, starting at 1
    pub fn attempt(&self) -> u32 {
        self.job.attempt_count
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Decode the payload; a payload that does not fit is a permanent failure
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Whether the soft time limit has passed; the handler should clean up and return
    pub fn soft_limit_exceeded(&self) -> bool {
        self.soft_limit.is_cancelled()
    }

    /// Resolves once the soft time limit passes. Never resolves without one.
    pub async fn soft_limit_reached(&self) {
        self.soft_limit.cancelled().await
    }

    /// Publish progress, visible through the status API
    pub async fn report_progress(&self, current: u64, total: u64) -> TaskResult<LeaseStatus> {
        self.broker
            .report_progress(&self.lease, Progress::new(current, total))
            .await
    }
}

/// Task handler trait for executing different types of jobs
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Whether this handler accepts jobs registered under another name
    fn can_handle(&self, _job_name: &str) -> bool {
        false
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError>;
}

/// Runs a typed [`Task`] decoded from the job payload
pub struct TaskRunner<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> TaskRunner<T> {
    pub fn new() -> Self {
        Self { _task: PhantomData }
    }
}

impl<T> Default for TaskRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Task + 'static> TaskHandler for TaskRunner<T> {
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
        let task: T = ctx.deserialize()?;
        let output = task.execute().await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure taking the job context as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send,
{
    async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
        (self.f)(ctx.clone()).await
    }
}

/// Registry for task handlers
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    /// Register a handler for a job name
    pub async fn register<H>(&self, job_name: String, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(job_name, Arc::new(handler));
    }

    /// Find a handler for a job
    async fn find_handler(&self, job_name: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read().await;

        if let Some(handler) = handlers.get(job_name) {
            return Some(handler.clone());
        }

        handlers
            .values()
            .find(|handler| handler.can_handle(job_name))
            .cloned()
    }
}

/// How an execution ended
enum Execution {
    Finished(Result<Value, JobError>),
    LeaseLost,
}

/// Everything a slot loop needs, cloned into each slot
#[derive(Clone)]
struct SlotContext {
    slot: String,
    config: WorkerConfig,
    broker: Arc<Broker>,
    handlers: Arc<TaskHandlerRegistry>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown_signal: Arc<RwLock<bool>>,
    active_jobs: Arc<RwLock<HashMap<JobId, AbortHandle>>>,
}

/// Worker processing jobs from the broker
pub struct Worker {
    config: WorkerConfig,
    broker: Arc<Broker>,
    handlers: Arc<TaskHandlerRegistry>,
    stats: Arc<Mutex<WorkerStats>>,
    shutdown_signal: Arc<RwLock<bool>>,
    active_jobs: Arc<RwLock<HashMap<JobId, AbortHandle>>>,
}

impl Worker {
    /// Create a new worker with the given configuration
    pub fn new(config: WorkerConfig, broker: Arc<Broker>) -> Self {
        let stats = WorkerStats {
            started_at: chrono::Utc::now(),
            ..Default::default()
        };

        Self {
            config,
            broker,
            handlers: Arc::new(TaskHandlerRegistry::default()),
            stats: Arc::new(Mutex::new(stats)),
            shutdown_signal: Arc::new(RwLock::new(false)),
            active_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.config.worker_id
    }

    /// Register a task handler
    pub async fn register_handler<H>(&self, job_name: &str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.register(job_name.to_string(), handler).await;
    }

    /// Register a typed task under the name its producers submit it with
    pub async fn register_task<T: Task + 'static>(&self, job_name: &str) {
        self.register_handler(job_name, TaskRunner::<T>::new()).await;
    }

    /// Run the worker until [`Worker::signal_shutdown`] is called
    pub async fn start(&self) -> TaskResult<()> {
        if self.config.concurrency == 0 {
            return Err(TaskError::worker("concurrency must be at least 1"));
        }
        if self.config.queues.is_empty() {
            return Err(TaskError::worker("no queues to consume"));
        }
        info!(
            "Starting worker {} with {} slots for queues: {:?}",
            self.config.worker_id, self.config.concurrency, self.config.queues
        );

        let housekeeper = self
            .config
            .run_housekeeping
            .then(|| Housekeeper::new(self.broker.clone()));
        let housekeeping = housekeeper.as_ref().map(Housekeeper::start);

        let slots: Vec<JoinHandle<()>> = (0..self.config.concurrency)
            .map(|index| tokio::spawn(Self::run_slot(self.slot_context(index))))
            .collect();

        while !*self.shutdown_signal.read().await {
            if slots.iter().all(JoinHandle::is_finished) {
                warn!("All slots of worker {} exited", self.config.worker_id);
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        if let Some(housekeeper) = &housekeeper {
            housekeeper.shutdown().await;
        }
        self.shutdown(slots).await?;
        if let Some(handle) = housekeeping {
            handle.abort();
        }
        Ok(())
    }

    fn slot_context(&self, index: usize) -> SlotContext {
        SlotContext {
            slot: self.config.slot_id(index),
            config: self.config.clone(),
            broker: self.broker.clone(),
            handlers: self.handlers.clone(),
            stats: self.stats.clone(),
            shutdown_signal: self.shutdown_signal.clone(),
            active_jobs: self.active_jobs.clone(),
        }
    }

    /// Claim and execute jobs until shutdown
    async fn run_slot(ctx: SlotContext) {
        let poll_timeout = Duration::from_millis(ctx.config.poll_timeout_ms);
        let batch = ctx.broker.config().prefetch_multiplier.max(1) as usize;
        debug!("Slot {} started", ctx.slot);

        loop {
            if *ctx.shutdown_signal.read().await {
                break;
            }

            let claims = match ctx
                .broker
                .poll(&ctx.slot, &ctx.config.queues, batch, poll_timeout)
                .await
            {
                Ok(claims) => claims,
                Err(e) => {
                    error!("Slot {} failed to poll: {}", ctx.slot, e);
                    sleep(poll_timeout).await;
                    continue;
                }
            };

            let queued: Vec<Lease> = claims
                .iter()
                .skip(1)
                .map(|claim| claim.lease.clone())
                .filter(|lease| lease.expires_at.is_some())
                .collect();
            let renew_queued = !queued.is_empty();
            let waiting = Arc::new(Mutex::new(queued));
            let holder = renew_queued.then(|| Self::hold_prefetched(&ctx, waiting.clone()));

            for claim in claims {
                waiting
                    .lock()
                    .await
                    .retain(|held| held.id != claim.lease.id);
                Self::process_claim(&ctx, claim).await;
            }
            if let Some(holder) = holder {
                holder.abort();
            }
        }

        debug!("Slot {} stopped", ctx.slot);
    }

    /// Renew the leases of prefetched claims until each one's turn to run.
    ///
    /// Stops on its own once the slot drops `waiting`.
    fn hold_prefetched(ctx: &SlotContext, waiting: Arc<Mutex<Vec<Lease>>>) -> JoinHandle<()> {
        let broker = ctx.broker.clone();
        let every = Duration::from_millis(ctx.config.heartbeat_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;

            while Arc::strong_count(&waiting) > 1 {
                ticker.tick().await;
                let leases = waiting.lock().await.clone();
                for lease in leases {
                    match broker.heartbeat(&lease).await {
                        Ok(LeaseStatus::Active { .. }) => {
                            debug!("Renewed prefetched lease on job {}", lease.job_id);
                        }
                        Ok(LeaseStatus::Lost) => {
                            warn!("Prefetched lease on job {} lost", lease.job_id);
                            waiting.lock().await.retain(|held| held.id != lease.id);
                        }
                        Err(e) => error!("Heartbeat for prefetched job {} failed: {}", lease.job_id, e),
                    }
                }
            }
        })
    }

    async fn process_claim(ctx: &SlotContext, claim: Claim) {
        let Claim { job, lease } = claim;
        let job_id = job.id;

        match ctx.broker.start(&lease).await {
            Ok(status) if status.is_active() => {}
            Ok(_) => {
                warn!("Lease on job {} lost before it started", job_id);
                return;
            }
            Err(e) => {
                error!("Failed to start job {}: {}", job_id, e);
                return;
            }
        }

        let Some(handler) = ctx.handlers.find_handler(&job.name).await else {
            error!("No handler found for job type: {}", job.name);
            let err = JobError::permanent(format!("No handler found for job type: {}", job.name));
            Self::acknowledge(ctx, &lease, Err(err)).await;
            return;
        };

        let heartbeat = lease
            .expires_at
            .map(|_| Duration::from_millis(ctx.config.heartbeat_interval_ms.max(1)));
        let job_ctx = JobContext::new(job, lease.clone(), ctx.broker.clone());
        let started = std::time::Instant::now();

        let soft_limit = ctx.config.soft_time_limit_ms.map(Duration::from_millis);
        let mut execution = tokio::spawn(Self::execute(handler, job_ctx, heartbeat, soft_limit));
        ctx.active_jobs
            .write()
            .await
            .insert(job_id, execution.abort_handle());

        let joined = match ctx.config.hard_time_limit_ms {
            Some(limit_ms) => {
                let limit = Duration::from_millis(limit_ms);
                match tokio::time::timeout(limit, &mut execution).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        execution.abort();
                        error!("Job {} exceeded its hard time limit of {:?}", job_id, limit);
                        Ok(Execution::Finished(Err(JobError::hard_timeout(format!(
                            "execution exceeded {:?}",
                            limit
                        )))))
                    }
                }
            }
            None => (&mut execution).await,
        };
        ctx.active_jobs.write().await.remove(&job_id);

        ctx.stats.lock().await.record_execution(started.elapsed());

        let result = match joined {
            Ok(Execution::Finished(result)) => result,
            Ok(Execution::LeaseLost) => {
                ctx.stats.lock().await.jobs_abandoned += 1;
                return;
            }
            Err(e) if e.is_cancelled() => {
                warn!("Execution of job {} was cancelled", job_id);
                ctx.stats.lock().await.jobs_abandoned += 1;
                return;
            }
            Err(e) => Err(JobError::permanent(format!("handler panicked: {}", e))),
        };

        Self::acknowledge(ctx, &lease, result).await;
    }

    /// Run the handler, renewing the lease while it works and raising the soft limit signal
    async fn execute(
        handler: Arc<dyn TaskHandler>,
        ctx: JobContext,
        heartbeat: Option<Duration>,
        soft_limit: Option<Duration>,
    ) -> Execution {
        let mut work = handler.handle(&ctx);
        let mut ticker = interval(heartbeat.unwrap_or(Duration::from_secs(60)));
        ticker.tick().await;
        let soft_deadline = sleep(soft_limit.unwrap_or_default());
        tokio::pin!(soft_deadline);

        loop {
            tokio::select! {
                result = &mut work => {
                    return Execution::Finished(Self::after_soft_limit(&ctx, result));
                }
                _ = ticker.tick(), if heartbeat.is_some() => match ctx.broker.heartbeat(ctx.lease()).await {
                    Ok(LeaseStatus::Active { .. }) => {
                        debug!("Renewed lease on job {}", ctx.job_id());
                    }
                    Ok(LeaseStatus::Lost) => {
                        warn!("Lease on job {} lost; abandoning execution", ctx.job_id());
                        return Execution::LeaseLost;
                    }
                    Err(e) => error!("Heartbeat for job {} failed: {}", ctx.job_id(), e),
                },
                _ = &mut soft_deadline, if soft_limit.is_some() && !ctx.soft_limit_exceeded() => {
                    warn!("Job {} passed its soft time limit of {:?}", ctx.job_id(), soft_limit);
                    ctx.soft_limit.cancel();
                }
            }
        }
    }

    /// A failure returned after the soft limit passed is reported as a soft timeout
    fn after_soft_limit(ctx: &JobContext, result: Result<Value, JobError>) -> Result<Value, JobError> {
        if !ctx.soft_limit_exceeded() {
            return result;
        }
        result.map_err(|err| match err {
            JobError::Timeout { .. } => err,
            other => JobError::soft_timeout(other.to_string()),
        })
    }

    async fn acknowledge(ctx: &SlotContext, lease: &Lease, result: Result<Value, JobError>) {
        let job_id = lease.job_id;
        let acked = match result {
            Ok(value) => ctx.broker.complete(lease, value).await,
            Err(err) => {
                debug!("Job {} returned error: {}", job_id, err);
                ctx.broker.fail(lease, err).await
            }
        };

        let mut stats = ctx.stats.lock().await;
        match acked {
            Ok(AckOutcome::Acked(JobState::Succeeded)) => stats.jobs_succeeded += 1,
            Ok(AckOutcome::Acked(JobState::RetryScheduled)) => stats.jobs_retried += 1,
            Ok(AckOutcome::Acked(_)) => stats.jobs_failed += 1,
            Ok(AckOutcome::Stale) => {
                warn!("Outcome of job {} discarded; its lease was lost", job_id);
                stats.jobs_abandoned += 1;
            }
            Err(e) => error!("Failed to acknowledge job {}: {}", job_id, e),
        }
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.lock().await.clone()
    }

    /// Signal worker to shutdown
    pub async fn signal_shutdown(&self) {
        let mut shutdown = self.shutdown_signal.write().await;
        *shutdown = true;
    }

    /// Graceful shutdown: let slots finish their current job, then abort what is left.
    ///
    /// Aborted jobs keep their lease until it expires and are then requeued.
    async fn shutdown(&self, slots: Vec<JoinHandle<()>>) -> TaskResult<()> {
        info!("Shutting down worker {}", self.config.worker_id);
        self.signal_shutdown().await;

        let start = std::time::Instant::now();
        let grace_period = Duration::from_secs(self.config.shutdown_grace_period);

        while start.elapsed() < grace_period {
            let running = slots.iter().filter(|slot| !slot.is_finished()).count();
            if running == 0 {
                break;
            }
            debug!("Waiting for {} slots to finish", running);
            sleep(Duration::from_millis(100)).await;
        }

        for (job_id, handle) in self.active_jobs.read().await.iter() {
            warn!("Force stopping job {}", job_id);
            handle.abort();
        }
        for slot in slots.iter().filter(|slot| !slot.is_finished()) {
            slot.abort();
        }

        info!("Worker {} shut down complete", self.config.worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl Task for Add {
        type Output = i64;

        async fn execute(&self) -> Result<i64, JobError> {
            Ok(self.a + self.b)
        }
    }

    struct Prefixed;

    #[async_trait]
    impl TaskHandler for Prefixed {
        fn can_handle(&self, job_name: &str) -> bool {
            job_name.starts_with("echo.")
        }

        async fn handle(&self, ctx: &JobContext) -> Result<Value, JobError> {
            Ok(ctx.payload().clone())
        }
    }

    fn context(name: &str, payload: Value) -> JobContext {
        let broker = Arc::new(Broker::new_default().unwrap());
        let job = broker.build_job(crate::job::JobSpec::new(name, payload));
        let lease = Lease::issue(job.id, "test", None, chrono::Utc::now());
        JobContext::new(job, lease, broker)
    }

    #[tokio::test]
    async fn registry_prefers_exact_names_then_can_handle() {
        let registry = TaskHandlerRegistry::default();
        registry.register("add".into(), TaskRunner::<Add>::new()).await;
        registry.register("echo".into(), Prefixed).await;

        assert!(registry.find_handler("add").await.is_some());
        assert!(registry.find_handler("echo.upper").await.is_some());
        assert!(registry.find_handler("missing").await.is_none());
    }

    #[tokio::test]
    async fn task_runner_decodes_payload_and_encodes_output() {
        let runner = TaskRunner::<Add>::new();
        let out = runner.handle(&context("add", json!({"a": 2, "b": 3}))).await;
        assert_eq!(out, Ok(json!(5)));

        let bad = runner.handle(&context("add", json!("nope"))).await;
        assert!(matches!(bad, Err(JobError::Permanent(_))));
    }

    #[tokio::test]
    async fn closures_can_be_handlers() {
        let handler = handler_fn(|ctx: JobContext| async move {
            let n: i64 = ctx.deserialize()?;
            Ok::<_, JobError>(json!(n * 2))
        });
        assert_eq!(handler.handle(&context("double", json!(21))).await, Ok(json!(42)));
    }
}
