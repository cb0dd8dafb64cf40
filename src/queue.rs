//! Named FIFO lanes holding the ids of pending jobs

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::job::JobId;

/// Queue lanes keyed by name.
///
/// Lanes only reference jobs; the job table owns them. An id may linger after
/// its job left `Pending` and is dropped lazily by the dispatcher scan.
#[derive(Debug, Default)]
pub struct Lanes {
    lanes: HashMap<String, VecDeque<JobId>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job id to the tail of its lane, creating the lane on first use
    pub fn push_back(&mut self, queue: &str, job_id: JobId) {
        self.lanes
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id);
    }

    pub fn lane_mut(&mut self, queue: &str) -> Option<&mut VecDeque<JobId>> {
        self.lanes.get_mut(queue)
    }

    /// Names of every lane that has ever been used, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lanes.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Snapshot of one lane and the jobs routed to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    /// Pending and eligible now
    pub ready_jobs: u64,
    /// Pending with a future `not_before` (ETA/countdown)
    pub delayed_jobs: u64,
    pub assigned_jobs: u64,
    pub running_jobs: u64,
    pub retry_scheduled_jobs: u64,
    pub succeeded_jobs: u64,
    pub failed_jobs: u64,
}

impl QueueStats {
    pub fn pending_jobs(&self) -> u64 {
        self.ready_jobs + self.delayed_jobs
    }

    pub fn in_flight_jobs(&self) -> u64 {
        self.assigned_jobs + self.running_jobs
    }
}
