//! Delivery job queue.
//!
//! At-least-once semantics: a fetched job stays leased until it is completed,
//! rescheduled or dropped. If the worker holding it disappears, the lease
//! expires and [`JobQueue::reclaim_stalled`] hands the job out again, which
//! means the same job can be processed twice. The ledger, not the queue,
//! decides whether a delivery is finished.

pub mod memory;
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_common::error::AppError;
use herald_common::retry::JobOptions;
use herald_common::types::DeliveryJob;

pub use memory::InMemoryJobQueue;
pub use redis_queue::RedisJobQueue;

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub name: String,
    pub data: DeliveryJob,
    pub opts: JobOptions,
    /// Failed attempts so far.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub failed_reason: Option<String>,
}

impl QueuedJob {
    pub fn new(data: DeliveryJob, opts: JobOptions) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: DELIVER_JOB_NAME.to_string(),
            data,
            opts,
            attempts_made: 0,
            enqueued_at: Utc::now(),
            failed_reason: None,
        }
    }
}

pub const DELIVER_JOB_NAME: &str = "deliver";

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The job will be handed out again after `delay`.
    Rescheduled { attempt: u32, delay: Duration },
    /// The job used all of its attempts and was dropped.
    Dropped { attempts: u32 },
}

/// Job counts by queue section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub dead: u64,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed job record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::Queue(err.to_string())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job and make it available to workers. Returns the job id.
    async fn enqueue(&self, data: DeliveryJob, opts: JobOptions) -> Result<String, QueueError>;

    /// Lease the next ready job, if any.
    async fn fetch(&self) -> Result<Option<QueuedJob>, QueueError>;

    /// Acknowledge a job as done and forget it.
    async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Record a failed attempt: reschedule with backoff, or drop the job once
    /// its attempts are used up.
    async fn fail(
        &self,
        job: &QueuedJob,
        reason: &str,
    ) -> Result<FailureDisposition, QueueError>;

    /// Return jobs whose lease expired to the waiting list.
    async fn reclaim_stalled(&self) -> Result<u64, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Shared failure bookkeeping for queue implementations.
pub(crate) fn record_failure(job: &QueuedJob, reason: &str) -> (QueuedJob, FailureDisposition) {
    let mut failed = job.clone();
    failed.attempts_made += 1;
    failed.failed_reason = Some(reason.to_string());

    let disposition = if failed.attempts_made < failed.opts.attempts {
        FailureDisposition::Rescheduled {
            attempt: failed.attempts_made + 1,
            delay: failed.opts.backoff_delay(failed.attempts_made),
        }
    } else {
        FailureDisposition::Dropped {
            attempts: failed.attempts_made,
        }
    };

    (failed, disposition)
}
