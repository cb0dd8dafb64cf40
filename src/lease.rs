//! Leases binding a claimed job to the worker slot executing it

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{deadline_after, JobId};

/// Unique identifier for leases
pub type LeaseId = Uuid;

/// Identity of a worker slot; any opaque string unique among live slots
pub type SlotId = String;

/// Time-bounded ownership of a job by one worker slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub job_id: JobId,
    pub slot: SlotId,
    pub issued_at: DateTime<Utc>,
    /// `None` when the job was acknowledged at claim time and is never reaped
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Issue a fresh lease; `ttl = None` issues a non-expiring lease
    pub fn issue(job_id: JobId, slot: &str, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
        Self {
            id: LeaseId::new_v4(),
            job_id,
            slot: slot.to_string(),
            issued_at: now,
            expires_at: ttl.map(|ttl| deadline_after(now, ttl)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Push the expiry out to `now + ttl`; non-expiring leases stay that way
    pub fn renew(&mut self, ttl: Duration, now: DateTime<Utc>) {
        if self.expires_at.is_some() {
            self.expires_at = Some(deadline_after(now, ttl));
        }
    }
}

/// Answer to a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The lease is still held; renewed until `expires_at`
    Active { expires_at: Option<DateTime<Utc>> },
    /// The lease expired or was superseded; the job was (or will be) handed to another slot
    Lost,
}

impl LeaseStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, LeaseStatus::Active { .. })
    }
}
