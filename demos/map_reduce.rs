//! Map-reduce example
//!
//! Splits a range of numbers into chunks, squares and sums each chunk in
//! parallel, then reduces the partial sums with a chord. The same chunks are
//! also run as a plain group to show the per-chunk results.
//!
//! To run this example: cargo run --example map_reduce

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tasklane::{handler_fn, Broker, BrokerConfig, Client, JobContext, JobError, JobSpec, Worker, WorkerConfig};
use tracing::{debug, info, Level};

const CHUNK_SIZE: usize = 100;

async fn map_sq_sum(ctx: JobContext) -> Result<Value, JobError> {
    let chunk: Vec<u64> = ctx.deserialize()?;
    debug!("Received a chunk of len: {}", chunk.len());
    Ok(json!(chunk.iter().map(|c| c * c).sum::<u64>()))
}

async fn reduce_sum(ctx: JobContext) -> Result<Value, JobError> {
    let sums: Vec<u64> = ctx.deserialize()?;
    Ok(json!(sums.iter().sum::<u64>()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let broker = Arc::new(Broker::connect(BrokerConfig::from_env()?).await?);
    let worker = Arc::new(Worker::new(
        WorkerConfig {
            concurrency: 4,
            ..Default::default()
        },
        broker.clone(),
    ));
    worker.register_handler("map_sq_sum", handler_fn(map_sq_sum)).await;
    worker.register_handler("reduce_sum", handler_fn(reduce_sum)).await;
    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.start().await })
    };

    let data: Vec<u64> = (1..1000).collect();
    let header = || -> Vec<JobSpec> {
        data.chunks(CHUNK_SIZE)
            .map(|chunk| JobSpec::new("map_sq_sum", json!(chunk)))
            .collect()
    };

    let client = Client::from_broker(broker);
    let timeout = Some(Duration::from_secs(180));

    let chord = client
        .chord(header(), JobSpec::new("reduce_sum", Value::Null))
        .await?;
    info!("Chord submitted. Workflow id: {}", chord);
    let status = client.wait_for_workflow(chord, timeout).await?;
    info!("Final result: {:?}", status.result);
    info!("Correct answer: {}", data.iter().map(|d| d * d).sum::<u64>());

    let group = client.group(header()).await?;
    let status = client.wait_for_workflow(group, timeout).await?;
    info!("Group result: {:?}", status.result);

    worker.signal_shutdown().await;
    running.await??;
    Ok(())
}
