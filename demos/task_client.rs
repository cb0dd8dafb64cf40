//! Task client example
//!
//! This example demonstrates how to:
//! 1. Submit jobs and wait for their results
//! 2. Delay jobs with a countdown
//! 3. Chain jobs so each receives the previous result
//! 4. Run a group and inspect per-member outcomes
//! 5. Query job state and queue statistics
//!
//! A worker runs in the same process so the example is self-contained.
//!
//! To run this example: cargo run --example task_client

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tasklane::{
    handler_fn, Broker, BrokerConfig, Client, GroupMode, JobContext, JobError, JobSpec, Task,
    TaskError, Worker, WorkerConfig,
};
use tracing::{info, Level};

/// A simple computation task
#[derive(Debug, Serialize, Deserialize)]
struct ComputeTask {
    operation: String,
    x: f64,
    y: f64,
}

#[async_trait::async_trait]
impl Task for ComputeTask {
    type Output = f64;

    async fn execute(&self) -> Result<Self::Output, JobError> {
        match self.operation.as_str() {
            "add" => Ok(self.x + self.y),
            "subtract" => Ok(self.x - self.y),
            "multiply" => Ok(self.x * self.y),
            "divide" => {
                if self.y == 0.0 {
                    Err(JobError::permanent("Division by zero"))
                } else {
                    Ok(self.x / self.y)
                }
            }
            _ => Err(JobError::permanent(format!(
                "Unknown operation: {}",
                self.operation
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "ComputeTask"
    }
}

/// Doubles whatever number it receives; used as a chain step
async fn double(ctx: JobContext) -> Result<Value, JobError> {
    let n: f64 = ctx.deserialize()?;
    Ok(json!(n * 2.0))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting task client example");

    let broker = Arc::new(Broker::new(BrokerConfig {
        default_queue: "math".to_string(),
        ..BrokerConfig::from_env()?
    })?);

    let worker = Arc::new(Worker::new(
        WorkerConfig {
            queues: vec!["math".to_string()],
            ..Default::default()
        },
        broker.clone(),
    ));
    worker.register_task::<ComputeTask>("ComputeTask").await;
    worker.register_handler("double", handler_fn(double)).await;
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.start().await })
    };

    let client = Client::from_broker(broker);
    let timeout = Some(Duration::from_secs(30));

    // Example 1: Submit and wait for a simple job
    info!("=== Example 1: Simple job submission ===");
    let task = ComputeTask {
        operation: "add".to_string(),
        x: 10.0,
        y: 20.0,
    };
    let job_id = client.submit_task(&task, "math").await?;
    info!("Submitted job: {}", job_id);
    match client.wait_for_result::<f64>(job_id, timeout).await {
        Ok(result) => info!("Job result: {}", result),
        Err(e) => info!("Job failed: {}", e),
    }

    // Example 2: A permanent failure is reported, not retried
    info!("=== Example 2: Permanent failure ===");
    let task = ComputeTask {
        operation: "divide".to_string(),
        x: 1.0,
        y: 0.0,
    };
    match client.submit_and_wait::<_, f64>(&task, "math", timeout).await {
        Ok(result) => info!("Unexpected result: {}", result),
        Err(TaskError::JobFailed { message, .. }) => info!("Job failed as expected: {}", message),
        Err(e) => return Err(e.into()),
    }

    // Example 3: Countdown
    info!("=== Example 3: Delayed job ===");
    let spec = JobSpec::from_task(&ComputeTask {
        operation: "multiply".to_string(),
        x: 6.0,
        y: 7.0,
    })?;
    let job_id = client.submit_after(spec, Duration::from_secs(2)).await?;
    let state = client.get_state(job_id).await?;
    info!("Delayed job {} is {:?}", job_id, state.state);
    let result: f64 = client.wait_for_result(job_id, timeout).await?;
    info!("Delayed job result: {}", result);

    // Example 4: Chain
    info!("=== Example 4: Chain ===");
    let first = JobSpec::from_task(&ComputeTask {
        operation: "subtract".to_string(),
        x: 50.0,
        y: 8.0,
    })?;
    let workflow = client
        .chain(vec![
            first,
            JobSpec::new("double", Value::Null),
            JobSpec::new("double", Value::Null),
        ])
        .await?;
    let status = client.wait_for_workflow(workflow, timeout).await?;
    info!("Chain finished as {:?} with {:?}", status.state, status.result);

    // Example 5: Group with partial results
    info!("=== Example 5: Group ===");
    let members = ["add", "divide", "multiply"]
        .iter()
        .map(|operation| {
            JobSpec::from_task(&ComputeTask {
                operation: operation.to_string(),
                x: 9.0,
                y: if *operation == "divide" { 0.0 } else { 3.0 },
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let workflow = client
        .group_with_mode(members, GroupMode::CollectPartial)
        .await?;
    let status = client.wait_for_workflow(workflow, timeout).await?;
    info!("Group finished as {:?} with {:?}", status.state, status.result);

    // Example 6: Queue statistics
    info!("=== Example 6: Queue statistics ===");
    for queue in client.list_queues().await {
        let stats = client.queue_stats(&queue).await;
        info!(
            "Queue '{}': {} pending, {} in flight, {} succeeded, {} failed",
            queue,
            stats.pending_jobs(),
            stats.in_flight_jobs(),
            stats.succeeded_jobs,
            stats.failed_jobs
        );
    }

    worker.signal_shutdown().await;
    running.await??;
    info!("Task client example completed!");
    Ok(())
}
