//! Error types for the broker and for job execution

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for broker operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors returned to callers of the broker, client and worker APIs
#[derive(Error, Debug)]
pub enum TaskError {
    /// Payload/result serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not known to the broker
    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// Workflow not known to the composer
    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    /// A transition was requested from a state that does not allow it
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    /// Backend operation errors (result store, journal)
    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    /// Worker errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Workflow composition errors
    #[error("Workflow error: {message}")]
    Workflow { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// A job reached its terminal failed state
    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
}

impl TaskError {
    /// Create a job-not-found error
    pub fn job_not_found<S: ToString>(job_id: S) -> Self {
        Self::JobNotFound {
            job_id: job_id.to_string(),
        }
    }

    /// Create a backend operation error
    pub fn backend<S: Into<String>, R: ToString>(operation: S, reason: R) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a workflow error
    pub fn workflow<S: Into<String>>(message: S) -> Self {
        Self::Workflow {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is recoverable (the caller may retry the call)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Timeout { .. } => true,
            TaskError::Backend { .. } => true,
            TaskError::Worker { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::JobNotFound { .. } => false,
            TaskError::WorkflowNotFound { .. } => false,
            TaskError::InvalidTransition { .. } => false,
            TaskError::Workflow { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::JobFailed { .. } => false,
        }
    }
}

/// Failure raised by a job handler.
///
/// The retry policy decides what happens next based on the variant:
/// transient failures and timeouts are retried with backoff, permanent
/// failures are terminal, `Retry` reschedules with an explicit countdown and
/// `Raised` is looked up in the policy's allowlist of transient codes.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("{} time limit exceeded: {message}", limit_kind(.hard))]
    Timeout { message: String, hard: bool },

    #[error("retry requested in {countdown:?}: {message}")]
    Retry { message: String, countdown: Duration },

    #[error("{code}: {message}")]
    Raised { code: String, message: String },
}

impl JobError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent(message.into())
    }

    /// Ask for a manual retry after `countdown`, skipping backoff
    pub fn retry_in<S: Into<String>>(message: S, countdown: Duration) -> Self {
        Self::Retry {
            message: message.into(),
            countdown,
        }
    }

    pub fn raised<C: Into<String>, S: Into<String>>(code: C, message: S) -> Self {
        Self::Raised {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn soft_timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
            hard: false,
        }
    }

    pub fn hard_timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
            hard: true,
        }
    }
}

fn limit_kind(hard: &bool) -> &'static str {
    if *hard {
        "hard"
    } else {
        "soft"
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        // a payload that does not decode is never retried
        JobError::Permanent(format!("invalid payload: {}", err))
    }
}

impl From<TaskError> for JobError {
    fn from(err: TaskError) -> Self {
        if err.is_recoverable() {
            JobError::Transient(err.to_string())
        } else {
            JobError::Permanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_task_errors_become_transient() {
        let err: JobError = TaskError::timeout("fetch").into();
        assert!(matches!(err, JobError::Transient(_)));

        let err: JobError = TaskError::config("bad").into();
        assert!(matches!(err, JobError::Permanent(_)));
    }

    #[test]
    fn timeout_display_names_the_limit() {
        let err = JobError::hard_timeout("took too long");
        assert_eq!(err.to_string(), "hard time limit exceeded: took too long");
        let err = JobError::soft_timeout("wrapping up");
        assert_eq!(err.to_string(), "soft time limit exceeded: wrapping up");
    }

    #[test]
    fn backend_failures_are_recoverable() {
        let err = TaskError::backend("journal_record", "connection reset");
        assert!(err.is_recoverable());
        assert!(matches!(JobError::from(err), JobError::Transient(_)));
    }
}
