//! # Tasklane
//!
//! A job broker in the spirit of Celery: producers submit jobs to named
//! queues, worker slots claim them under time-bounded leases, and the broker
//! retries, expires and composes them.
//!
//! ## Features
//!
//! - At-least-once delivery with leases, heartbeats and requeue on expiry
//! - Retries with exponential backoff, jitter and a cap
//! - Result storage with expiry (in memory or Redis)
//! - Chains, groups and chords, plus success/error callbacks
//! - A write-ahead journal so a restarted broker recovers its jobs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasklane::{Broker, Client, JobError, Task, Worker, WorkerConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Add {
//!     a: i64,
//!     b: i64,
//! }
//!
//! #[async_trait::async_trait]
//! impl Task for Add {
//!     type Output = i64;
//!
//!     async fn execute(&self) -> Result<Self::Output, JobError> {
//!         Ok(self.a + self.b)
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "add"
//!     }
//! }
//!
//! # async fn run() -> tasklane::TaskResult<()> {
//! let broker = Arc::new(Broker::new_default()?);
//! let worker = Worker::new(WorkerConfig::default(), broker.clone());
//! worker.register_task::<Add>("add").await;
//!
//! let client = Client::from_broker(broker);
//! let job_id = client.submit_task(&Add { a: 2, b: 3 }, "default").await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod journal;
pub mod lease;
pub mod queue;
pub mod results;
pub mod retry;
pub mod scheduler;
pub mod tracker;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use broker::{Broker, Claim, JobStatus};
pub use client::Client;
pub use config::BrokerConfig;
pub use error::{JobError, TaskError, TaskResult};
pub use job::{Job, JobId, JobSpec, JobState, Linkage, Progress, Task};
pub use lease::{Lease, LeaseStatus};
pub use results::{JobOutcome, ResultLookup};
pub use retry::RetryPolicy;
pub use scheduler::Housekeeper;
pub use tracker::AckOutcome;
pub use worker::{handler_fn, JobContext, TaskHandler, Worker, WorkerConfig};
pub use workflow::{ChordFailureMode, GroupMode, WorkflowId, WorkflowState, WorkflowStatus};

/// Version of the tasklane library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
