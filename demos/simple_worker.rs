//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Define typed tasks
//! 2. Set up a worker with task handlers
//! 3. Run the worker until Ctrl-C
//!
//! Set `TASKLANE_REDIS_URL` to keep results and the job journal in Redis;
//! otherwise everything stays in memory.
//!
//! To run this example: cargo run --example simple_worker

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tasklane::{handler_fn, Broker, BrokerConfig, Client, JobContext, JobError, Task, Worker, WorkerConfig};
use tracing::{info, Level};

/// A simple math task that adds two numbers
#[derive(Debug, Serialize, Deserialize)]
struct AddTask {
    a: i32,
    b: i32,
}

#[async_trait::async_trait]
impl Task for AddTask {
    type Output = i32;

    async fn execute(&self) -> Result<Self::Output, JobError> {
        // Simulate some work
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        info!("Adding {} + {} = {}", self.a, self.b, self.a + self.b);
        Ok(self.a + self.b)
    }

    fn name(&self) -> &'static str {
        "AddTask"
    }
}

/// A task that processes a message
#[derive(Debug, Serialize, Deserialize)]
struct MessageTask {
    message: String,
    uppercase: bool,
}

#[async_trait::async_trait]
impl Task for MessageTask {
    type Output = String;

    async fn execute(&self) -> Result<Self::Output, JobError> {
        if self.message.is_empty() {
            return Err(JobError::permanent("empty message"));
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let result = if self.uppercase {
            self.message.to_uppercase()
        } else {
            self.message.to_lowercase()
        };

        info!("Processed message: '{}' -> '{}'", self.message, result);
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "MessageTask"
    }
}

/// Handler that reports progress while it counts
async fn count_to(ctx: JobContext) -> Result<serde_json::Value, JobError> {
    let target: u64 = ctx.deserialize()?;
    for step in 1..=target {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        ctx.report_progress(step, target)
            .await
            .map_err(JobError::from)?;
    }
    Ok(serde_json::json!(target))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting simple worker example");

    let config = BrokerConfig::from_env()?;
    let broker = Arc::new(Broker::connect(config).await?);

    let worker_config = WorkerConfig {
        queues: vec!["examples".to_string(), "math".to_string()],
        concurrency: 2,
        ..Default::default()
    };
    let worker = Arc::new(Worker::new(worker_config, broker.clone()));

    worker.register_task::<AddTask>("AddTask").await;
    worker.register_task::<MessageTask>("MessageTask").await;
    worker.register_handler("count_to", handler_fn(count_to)).await;

    // Submit some test jobs first
    let client = Client::from_broker(broker);

    info!("Submitting test jobs...");
    for i in 0..5 {
        let task = AddTask { a: i, b: i * 2 };
        let job_id = client.submit_task(&task, "math").await?;
        info!("Submitted AddTask {}: {}", i, job_id);
    }

    let messages = vec![
        ("Hello World", true),
        ("Rust is Amazing", false),
        ("", true),
    ];
    for (msg, uppercase) in messages {
        let task = MessageTask {
            message: msg.to_string(),
            uppercase,
        };
        let job_id = client.submit_task(&task, "examples").await?;
        info!("Submitted MessageTask '{}': {}", msg, job_id);
    }

    let counter = client
        .submit(tasklane::JobSpec::new("count_to", serde_json::json!(10)).on_queue("examples"))
        .await?;
    info!("Submitted count_to: {}", counter);

    let shutdown = {
        let worker = worker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                worker.signal_shutdown().await;
            }
        })
    };

    info!("Starting worker (Ctrl-C to stop)...");
    worker.start().await?;
    shutdown.abort();

    let stats = worker.get_stats().await;
    info!(
        "Processed {} jobs: {} succeeded, {} failed, {} retried",
        stats.jobs_processed, stats.jobs_succeeded, stats.jobs_failed, stats.jobs_retried
    );
    Ok(())
}
