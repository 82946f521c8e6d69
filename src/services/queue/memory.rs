use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;
use tokio::time::Instant;

use super::{validate_request, JobBroker, QueueError, QueueSettings};
use crate::models::job::{
    EnqueueOutcome, FailOutcome, Job, JobRequest, JobStatus, QueueName, QueueStats,
};
use crate::services::retry::{backoff_delay, should_retry};

struct Entry {
    job: Job,
    seq: u64,
    ready_at: Option<Instant>,
    lease_deadline: Option<Instant>,
    finished: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl QueueState {
    fn push_waiting(&mut self, id: &str) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.job.status = JobStatus::Waiting;
            entry.seq = seq;
            entry.ready_at = None;
        }
    }

    /// Promote due retries and reclaim jobs whose lease ran out.
    fn refresh(&mut self, now: Instant) {
        let due: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.job.status == JobStatus::Delayed && e.ready_at.is_some_and(|t| t <= now))
            .map(|e| e.job.id.clone())
            .collect();
        for id in due {
            self.push_waiting(&id);
        }

        let stalled: Vec<String> = self
            .entries
            .values()
            .filter(|e| {
                e.job.status == JobStatus::Active && e.lease_deadline.is_some_and(|t| t <= now)
            })
            .map(|e| e.job.id.clone())
            .collect();
        for id in stalled {
            tracing::warn!(job_id = %id, "Lease expired, reclaiming job");
            let exhausted = match self.entries.get_mut(&id) {
                Some(entry) => {
                    entry.job.lease_token = None;
                    entry.lease_deadline = None;
                    if entry.job.has_attempts_left() {
                        false
                    } else {
                        entry.job.status = JobStatus::Failed;
                        entry.job.last_error = Some("lease expired".to_string());
                        entry.job.finished_at = Some(Utc::now());
                        entry.finished = Some(now);
                        true
                    }
                }
                None => continue,
            };
            if !exhausted {
                self.push_waiting(&id);
            }
        }
    }

    fn purge(&mut self, now: Instant, retention: std::time::Duration) {
        self.entries.retain(|_, e| match e.finished {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
    }

    fn leased_mut(&mut self, job: &Job) -> Result<&mut Entry, QueueError> {
        match self.entries.get_mut(&job.id) {
            Some(entry)
                if entry.job.status == JobStatus::Active
                    && entry.job.lease_token.is_some()
                    && entry.job.lease_token == job.lease_token =>
            {
                Ok(entry)
            }
            _ => Err(QueueError::LeaseLost { id: job.id.clone() }),
        }
    }
}

/// In-process broker with the same contract as the Redis broker.
///
/// Suitable for a single-process deployment and for tests; state does not
/// survive a restart.
pub struct MemoryJobQueue {
    settings: QueueSettings,
    queues: Mutex<HashMap<QueueName, QueueState>>,
    limiters: HashMap<QueueName, DefaultDirectRateLimiter>,
}

impl MemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let per_second = NonZeroU32::new(settings.rate_limit_per_sec.max(1)).unwrap_or(NonZeroU32::MIN);
        let limiters = QueueName::ALL
            .into_iter()
            .map(|queue| (queue, RateLimiter::direct(Quota::per_second(per_second))))
            .collect();
        Self {
            settings,
            queues: Mutex::new(HashMap::new()),
            limiters,
        }
    }

    fn with_state<T>(&self, queue: QueueName, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(queues.entry(queue).or_default())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobBroker for MemoryJobQueue {
    async fn enqueue(&self, request: JobRequest) -> Result<EnqueueOutcome, QueueError> {
        validate_request(&request)?;
        let queue = request.queue();
        let now = Instant::now();
        let retention = self.settings.retention;

        Ok(self.with_state(queue, |state| {
            state.purge(now, retention);
            if let Some(existing) = state.entries.get(&request.id) {
                // A failed record may be replaced; a retained completed one may not.
                if existing.job.status.is_outstanding()
                    || existing.job.status == JobStatus::Completed
                {
                    return EnqueueOutcome::Deduplicated(request.id);
                }
            }

            let job = Job {
                id: request.id.clone(),
                queue,
                payload: request.payload,
                priority: request.priority,
                attempts: 0,
                max_attempts: queue.max_attempts(),
                status: JobStatus::Waiting,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                last_error: None,
                lease_token: None,
            };
            state.entries.insert(
                request.id.clone(),
                Entry {
                    job,
                    seq: 0,
                    ready_at: None,
                    lease_deadline: None,
                    finished: None,
                },
            );
            state.push_waiting(&request.id);
            EnqueueOutcome::Accepted(request.id)
        }))
    }

    async fn dequeue(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        let now = Instant::now();
        let lease = self.settings.lease;

        Ok(self.with_state(queue, |state| {
            state.refresh(now);

            let next = state
                .entries
                .values()
                .filter(|e| e.job.status == JobStatus::Waiting)
                .min_by_key(|e| (e.job.priority.value(), e.seq))
                .map(|e| e.job.id.clone())?;

            if let Some(limiter) = self.limiters.get(&queue) {
                if limiter.check().is_err() {
                    tracing::trace!(queue = %queue, "Dequeue rate limit reached");
                    return None;
                }
            }

            let entry = state.entries.get_mut(&next)?;
            entry.job.status = JobStatus::Active;
            entry.job.attempts += 1;
            entry.job.started_at = Some(Utc::now());
            entry.job.lease_token = Some(uuid::Uuid::new_v4().to_string());
            entry.lease_deadline = Some(now + lease);
            Some(entry.job.clone())
        }))
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        let now = Instant::now();
        let retention = self.settings.retention;
        self.with_state(job.queue, |state| {
            let entry = state.leased_mut(job)?;
            entry.job.status = JobStatus::Completed;
            entry.job.lease_token = None;
            entry.job.finished_at = Some(Utc::now());
            entry.lease_deadline = None;
            entry.finished = Some(now);
            state.purge(now, retention);
            Ok(())
        })
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome, QueueError> {
        let now = Instant::now();
        let retention = self.settings.retention;
        self.with_state(job.queue, |state| {
            let entry = state.leased_mut(job)?;
            let attempts = entry.job.attempts;
            entry.job.lease_token = None;
            entry.job.last_error = Some(error.to_string());
            entry.lease_deadline = None;

            if should_retry(attempts, entry.job.max_attempts) {
                let delay = backoff_delay(attempts);
                entry.job.status = JobStatus::Delayed;
                entry.ready_at = Some(now + delay);
                Ok(FailOutcome::Retrying {
                    attempt: attempts,
                    delay,
                })
            } else {
                entry.job.status = JobStatus::Failed;
                entry.job.finished_at = Some(Utc::now());
                entry.finished = Some(now);
                state.purge(now, retention);
                Ok(FailOutcome::Terminal { attempts })
            }
        })
    }

    async fn extend_lease(&self, job: &Job) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.settings.lease;
        self.with_state(job.queue, |state| {
            state.leased_mut(job)?.lease_deadline = Some(deadline);
            Ok(())
        })
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        Ok(self.with_state(queue, |state| {
            let mut stats = QueueStats::default();
            for entry in state.entries.values() {
                match entry.job.status {
                    JobStatus::Waiting => stats.waiting += 1,
                    JobStatus::Delayed => stats.delayed += 1,
                    JobStatus::Active => stats.active += 1,
                    JobStatus::Completed => stats.completed += 1,
                    JobStatus::Failed => stats.failed += 1,
                }
            }
            stats
        }))
    }

    async fn get_job(&self, queue: QueueName, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.with_state(queue, |state| {
            state.entries.get(id).map(|e| e.job.clone())
        }))
    }

    async fn retry_failed(&self, queue: QueueName, id: &str) -> Result<bool, QueueError> {
        Ok(self.with_state(queue, |state| {
            match state.entries.get_mut(id) {
                Some(entry) if entry.job.status == JobStatus::Failed => {
                    entry.job.attempts = 0;
                    entry.job.started_at = None;
                    entry.job.finished_at = None;
                    entry.job.last_error = None;
                    entry.finished = None;
                }
                _ => return false,
            }
            state.push_waiting(id);
            true
        }))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{
        IndexPayload, JobPayload, MaintenanceKind, MaintenancePayload, Priority, SnapshotPayload,
    };
    use std::time::Duration;

    fn snapshot(bookmark_id: &str) -> JobRequest {
        JobRequest::new(JobPayload::Snapshot(SnapshotPayload {
            bookmark_id: bookmark_id.to_string(),
            url: format!("https://example.com/{bookmark_id}"),
            owner_id: "u1".to_string(),
            owner_plan: "pro".to_string(),
        }))
    }

    fn index(bookmark_id: &str) -> JobRequest {
        JobRequest::new(JobPayload::Index(IndexPayload {
            bookmark_id: bookmark_id.to_string(),
            snapshot_path: format!("snapshots/u1/{bookmark_id}/page.html"),
            owner_id: "u1".to_string(),
        }))
    }

    fn unlimited() -> MemoryJobQueue {
        MemoryJobQueue::new(QueueSettings {
            rate_limit_per_sec: 10_000,
            ..QueueSettings::default()
        })
    }

    #[tokio::test]
    async fn test_dedup_while_waiting_and_active() {
        let queue = unlimited();
        assert!(queue.enqueue(snapshot("B1")).await.unwrap().is_accepted());
        let second = queue.enqueue(snapshot("B1")).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Deduplicated("B1".to_string()));
        assert_eq!(queue.stats(QueueName::Snapshot).await.unwrap().waiting, 1);

        let job = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        assert!(!queue.enqueue(snapshot("B1")).await.unwrap().is_accepted());
        let stats = queue.stats(QueueName::Snapshot).await.unwrap();
        assert_eq!((stats.waiting, stats.active), (0, 1));

        queue.ack(&job).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_job_blocks_resubmission_until_purged() {
        let queue = MemoryJobQueue::new(QueueSettings {
            rate_limit_per_sec: 10_000,
            retention: Duration::from_secs(60),
            ..QueueSettings::default()
        });
        queue.enqueue(snapshot("B1")).await.unwrap();
        let job = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        queue.ack(&job).await.unwrap();

        let again = queue.enqueue(snapshot("B1")).await.unwrap();
        assert_eq!(again, EnqueueOutcome::Deduplicated("B1".to_string()));
        let stats = queue.stats(QueueName::Snapshot).await.unwrap();
        assert_eq!((stats.waiting, stats.completed), (0, 1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(queue.enqueue(snapshot("B1")).await.unwrap().is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_can_be_resubmitted() {
        let queue = unlimited();
        let request = JobRequest::new(JobPayload::Maintenance(MaintenancePayload {
            kind: MaintenanceKind::BrokenLinkScan,
            owner_id: Some("u1".to_string()),
        }))
        .with_id("scan-1");
        queue.enqueue(request.clone()).await.unwrap();
        let job = queue.dequeue(QueueName::Maintenance).await.unwrap().unwrap();
        queue.fail(&job, "db down").await.unwrap();
        tokio::time::advance(Duration::from_millis(2100)).await;
        let job = queue.dequeue(QueueName::Maintenance).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&job, "db down").await.unwrap(),
            FailOutcome::Terminal { attempts: 2 }
        );

        assert!(queue.enqueue(request).await.unwrap().is_accepted());
        let job = queue.get_job(QueueName::Maintenance, "scan-1").await.unwrap().unwrap();
        assert_eq!((job.status, job.attempts), (JobStatus::Waiting, 0));
    }

    #[tokio::test]
    async fn test_bookmark_jobs_are_keyed_by_bookmark_id() {
        let queue = unlimited();
        queue.enqueue(snapshot("B1")).await.unwrap();
        let err = queue.enqueue(snapshot("B1").with_id("custom")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { queue: QueueName::Snapshot, .. }));
        assert!(queue.enqueue(index("B1").with_id("other")).await.is_err());
        assert!(queue.enqueue(index("B1").with_id("B1")).await.unwrap().is_accepted());
        assert_eq!(queue.stats(QueueName::Snapshot).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_same_id_on_different_queues_is_independent() {
        let queue = unlimited();
        assert!(queue.enqueue(snapshot("B1")).await.unwrap().is_accepted());
        assert!(queue.enqueue(index("B1")).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_rejects_invalid_payload() {
        let queue = unlimited();
        let mut request = snapshot("B1");
        if let JobPayload::Snapshot(p) = &mut request.payload {
            p.url = "javascript:alert(1)".to_string();
        }
        let err = queue.enqueue(request).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { queue: QueueName::Snapshot, .. }));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = unlimited();
        queue.enqueue(snapshot("low").with_priority(Priority::Low)).await.unwrap();
        queue.enqueue(snapshot("n1")).await.unwrap();
        queue.enqueue(snapshot("high").with_priority(Priority::High)).await.unwrap();
        queue.enqueue(snapshot("n2")).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.dequeue(QueueName::Snapshot).await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, ["high", "n1", "n2", "low"]);
    }

    #[tokio::test]
    async fn test_exclusive_lease() {
        let queue = unlimited();
        queue.enqueue(snapshot("B1")).await.unwrap();
        let job = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        assert!(queue.dequeue(QueueName::Snapshot).await.unwrap().is_none());

        let mut forged = job.clone();
        forged.lease_token = Some("someone-else".to_string());
        assert!(matches!(queue.ack(&forged).await, Err(QueueError::LeaseLost { .. })));
        queue.ack(&job).await.unwrap();
        assert!(matches!(queue.ack(&job).await, Err(QueueError::LeaseLost { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_and_backoff() {
        let queue = unlimited();
        queue.enqueue(snapshot("B1")).await.unwrap();

        for attempt in 1..=2u32 {
            let job = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
            assert_eq!(job.attempts, attempt);
            let outcome = queue.fail(&job, "timeout").await.unwrap();
            let expected = Duration::from_secs(2 * 2u64.pow(attempt - 1));
            assert_eq!(outcome, FailOutcome::Retrying { attempt, delay: expected });

            // Not ready until the backoff delay has passed.
            tokio::time::advance(expected - Duration::from_millis(1)).await;
            assert!(queue.dequeue(QueueName::Snapshot).await.unwrap().is_none());
            assert_eq!(queue.stats(QueueName::Snapshot).await.unwrap().delayed, 1);
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        let job = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        let outcome = queue.fail(&job, "timeout").await.unwrap();
        assert_eq!(outcome, FailOutcome::Terminal { attempts: 3 });

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(queue.dequeue(QueueName::Snapshot).await.unwrap().is_none());
        let stats = queue.stats(QueueName::Snapshot).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.waiting + stats.delayed + stats.active, 0);

        let failed = queue.get_job(QueueName::Snapshot, "B1").await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_budget_is_two() {
        let queue = unlimited();
        let request = JobRequest::new(JobPayload::Maintenance(
            crate::models::job::MaintenancePayload {
                kind: crate::models::job::MaintenanceKind::DuplicateDetection,
                owner_id: None,
            },
        ));
        queue.enqueue(request).await.unwrap();

        let job = queue.dequeue(QueueName::Maintenance).await.unwrap().unwrap();
        assert!(matches!(queue.fail(&job, "db down").await.unwrap(), FailOutcome::Retrying { .. }));
        tokio::time::advance(Duration::from_secs(2)).await;
        let job = queue.dequeue(QueueName::Maintenance).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&job, "db down").await.unwrap(),
            FailOutcome::Terminal { attempts: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_resets_budget() {
        let queue = unlimited();
        queue.enqueue(index("B1")).await.unwrap();
        for _ in 0..3 {
            let job = queue.dequeue(QueueName::Index).await.unwrap().unwrap();
            queue.fail(&job, "search unavailable").await.unwrap();
            tokio::time::advance(Duration::from_secs(60)).await;
        }
        assert!(!queue.retry_failed(QueueName::Index, "missing").await.unwrap());
        assert!(queue.retry_failed(QueueName::Index, "B1").await.unwrap());

        let job = queue.dequeue(QueueName::Index).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimed() {
        let queue = MemoryJobQueue::new(QueueSettings {
            rate_limit_per_sec: 10_000,
            lease: Duration::from_secs(30),
            ..QueueSettings::default()
        });
        queue.enqueue(snapshot("B1")).await.unwrap();
        let stale = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        queue.extend_lease(&stale).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(queue.dequeue(QueueName::Snapshot).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let reclaimed = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert!(matches!(queue.ack(&stale).await, Err(QueueError::LeaseLost { .. })));
        queue.ack(&reclaimed).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_purges_finished_jobs() {
        let queue = MemoryJobQueue::new(QueueSettings {
            rate_limit_per_sec: 10_000,
            retention: Duration::from_secs(60),
            ..QueueSettings::default()
        });
        queue.enqueue(snapshot("B1")).await.unwrap();
        queue.enqueue(snapshot("B2")).await.unwrap();
        let first = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        queue.ack(&first).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let second = queue.dequeue(QueueName::Snapshot).await.unwrap().unwrap();
        queue.ack(&second).await.unwrap();

        assert!(queue.get_job(QueueName::Snapshot, "B1").await.unwrap().is_none());
        assert!(queue.get_job(QueueName::Snapshot, "B2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_per_queue() {
        let queue = MemoryJobQueue::default();
        for i in 0..12 {
            queue.enqueue(snapshot(&format!("B{i}"))).await.unwrap();
        }
        queue.enqueue(index("B0")).await.unwrap();

        let mut served = 0;
        while queue.dequeue(QueueName::Snapshot).await.unwrap().is_some() {
            served += 1;
        }
        assert_eq!(served, 10);
        // Other queues have their own budget.
        assert!(queue.dequeue(QueueName::Index).await.unwrap().is_some());
    }
}
