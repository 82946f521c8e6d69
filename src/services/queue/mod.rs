//! Job queue broker.
//!
//! Durable, priority-ordered, at-least-once job store with deduplication by job
//! id, exclusive leases for active jobs, exponential retry backoff and a
//! per-queue dequeue rate limit. [`JobQueue`] keeps state in Redis and is safe to
//! share between worker replicas; [`MemoryJobQueue`] has the same semantics
//! inside a single process.

mod memory;
mod redis_queue;

use async_trait::async_trait;
use std::time::Duration;

use crate::models::job::{
    EnqueueOutcome, FailOutcome, Job, JobPayload, JobRequest, QueueName, QueueStats,
};

pub use self::memory::MemoryJobQueue;
pub use self::redis_queue::JobQueue;

/// Broker tuning shared by all queues.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Dequeues admitted per queue per second, across all workers.
    pub rate_limit_per_sec: u32,
    /// How long an active job stays leased without renewal.
    pub lease: Duration,
    /// How long completed and failed job records are kept.
    pub retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 10,
            lease: Duration::from_secs(120),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Submit a job. A job whose id is already waiting, delayed or active is
    /// not duplicated; the existing id is returned instead.
    async fn enqueue(&self, request: JobRequest) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the highest-priority ready job, if any and if the queue's rate
    /// limit allows another dequeue right now.
    async fn dequeue(&self, queue: QueueName) -> Result<Option<Job>, QueueError>;

    /// Mark a leased job completed.
    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    /// Record a failed attempt. The broker schedules a retry after the backoff
    /// delay or, once the attempt budget is spent, fails the job terminally.
    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError>;

    /// Renew the lease on a job that is still being processed.
    async fn extend_lease(&self, job: &Job) -> Result<(), QueueError>;

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError>;

    async fn get_job(&self, queue: QueueName, id: &str) -> Result<Option<Job>, QueueError>;

    /// Return a terminally failed job to the queue with a fresh attempt budget.
    /// Returns `false` when no failed job with that id is retained.
    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<bool, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Reject payloads that do not match their queue schema, and bookmark jobs
/// whose id is not their bookmark id.
pub(crate) fn validate_request(request: &JobRequest) -> Result<(), QueueError> {
    if request.id.is_empty() {
        return Err(QueueError::InvalidPayload {
            queue: request.queue(),
            reason: "job id must not be empty".to_string(),
        });
    }
    if let Some(bookmark_id) = request.payload.bookmark_id() {
        if request.id != bookmark_id {
            return Err(QueueError::InvalidPayload {
                queue: request.queue(),
                reason: format!("job id must be the bookmark id {bookmark_id}"),
            });
        }
    }
    request
        .payload
        .validate()
        .map_err(|report| QueueError::InvalidPayload {
            queue: request.queue(),
            reason: report.to_string(),
        })
}

pub(crate) fn decode_payload(queue: QueueName, raw: &str) -> Result<JobPayload, QueueError> {
    JobPayload::from_json(queue, raw).map_err(QueueError::Serialize)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid {queue} payload: {reason}")]
    InvalidPayload { queue: QueueName, reason: String },

    #[error("Lease on job {id} is no longer held by this worker")]
    LeaseLost { id: String },

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}
