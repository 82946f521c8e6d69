//! Worker runtime.
//!
//! Each queue is served by a [`WorkerPool`]: a fixed number of executors that
//! lease jobs from the broker and hand them to the queue's [`JobHandler`].
//!
//! ```text
//! WorkerPool (per queue)
//!     ├─► dequeue (rate limited by the broker)
//!     ├─► handler.handle(job) in its own task, lease renewed meanwhile
//!     │       └─► StageOutput { mutations, follow_ups }
//!     ├─► apply mutations to the bookmark store
//!     ├─► enqueue follow-up jobs (deduplicated by id)
//!     └─► ack, or fail → broker schedules a retry or fails terminally
//! ```
//!
//! Follow-ups are enqueued before the ack. If the process dies in between,
//! the lease expires, the job reruns from the top and the repeated enqueue
//! collapses onto the existing job id.

pub mod index;
pub mod maintenance;
pub mod schedule;
pub mod snapshot;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{BookmarkStore, StoreError};
use crate::models::bookmark::BookmarkMutation;
use crate::models::job::{FailOutcome, Job, JobRequest, QueueName};
use crate::services::browser::RenderError;
use crate::services::queue::{JobBroker, QueueError};
use crate::services::search::SearchError;
use crate::services::storage::StorageError;
use crate::services::thumbnail::ThumbnailError;

pub use self::index::IndexHandler;
pub use self::maintenance::MaintenanceHandler;
pub use self::snapshot::SnapshotHandler;

/// Side effects a stage asks the runtime to perform once it succeeds.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub mutations: Vec<(String, BookmarkMutation)>,
    pub follow_ups: Vec<JobRequest>,
}

impl StageOutput {
    pub fn mutate(mut self, bookmark_id: impl Into<String>, mutation: BookmarkMutation) -> Self {
        self.mutations.push((bookmark_id.into(), mutation));
        self
    }

    pub fn then(mut self, request: JobRequest) -> Self {
        self.follow_ups.push(request);
        self
    }
}

/// Processing logic for one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn handle(&self, job: &Job) -> Result<StageOutput, WorkerError>;

    /// Called once after the pool has drained.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Sleep between dequeue attempts when the queue is empty or rate limited.
    pub poll_interval: Duration,
    /// How often an active job's lease is renewed.
    pub heartbeat_interval: Duration,
}

impl PoolConfig {
    pub fn for_queue(queue: QueueName, lease: Duration) -> Self {
        Self {
            concurrency: queue.default_concurrency(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: (lease / 3).max(Duration::from_millis(100)),
        }
    }
}

/// Bounded pool of executors serving one queue.
pub struct WorkerPool {
    broker: Arc<dyn JobBroker>,
    store: Arc<dyn BookmarkStore>,
    handler: Arc<dyn JobHandler>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        store: Arc<dyn BookmarkStore>,
        handler: Arc<dyn JobHandler>,
        config: PoolConfig,
    ) -> Self {
        Self {
            broker,
            store,
            handler,
            config,
        }
    }

    /// Run until `shutdown` is cancelled, then let in-flight jobs finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let queue = self.handler.queue();
        let concurrency = self.config.concurrency.max(1);
        info!(%queue, concurrency, "Worker pool starting");

        let pool = Arc::new(self);
        let mut executors = JoinSet::new();
        for slot in 0..concurrency {
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            executors.spawn(async move { pool.executor(slot, shutdown).await });
        }

        while let Some(joined) = executors.join_next().await {
            if let Err(e) = joined {
                error!(%queue, error = %e, "Worker executor aborted");
            }
        }

        pool.handler.shutdown().await;
        info!(%queue, "Worker pool stopped");
    }

    async fn executor(&self, slot: usize, shutdown: CancellationToken) {
        let queue = self.handler.queue();
        debug!(%queue, slot, "Executor started");

        while !shutdown.is_cancelled() {
            match self.broker.dequeue(queue).await {
                Ok(Some(job)) => {
                    self.process(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(%queue, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        debug!(%queue, slot, "Executor stopped");
    }

    /// Run one leased job to completion and settle it with the broker.
    pub async fn process(&self, job: Job) {
        let queue = job.queue;
        let start = Instant::now();
        info!(
            job_id = %job.id,
            %queue,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let result = match self.execute_with_heartbeat(&job).await {
            Ok(output) => self.commit(&job, output).await,
            Err(e) => Err(e),
        };

        let elapsed = start.elapsed();
        metrics::histogram!("job_duration_seconds", "queue" => queue.to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(()) => match self.broker.ack(&job).await {
                Ok(()) => {
                    metrics::counter!("jobs_completed_total", "queue" => queue.to_string())
                        .increment(1);
                    info!(
                        job_id = %job.id,
                        %queue,
                        duration_ms = elapsed.as_millis() as u64,
                        "Job completed"
                    );
                }
                Err(e) => {
                    warn!(job_id = %job.id, %queue, error = %e, "Failed to acknowledge job");
                }
            },
            Err(e) => self.settle_failure(&job, &e).await,
        }
    }

    async fn settle_failure(&self, job: &Job, failure: &WorkerError) {
        let queue = job.queue;
        match self.broker.fail(job, &failure.to_string()).await {
            Ok(FailOutcome::Retrying { attempt, delay }) => {
                metrics::counter!(
                    "jobs_failed_total",
                    "queue" => queue.to_string(),
                    "outcome" => "retry"
                )
                .increment(1);
                warn!(
                    job_id = %job.id,
                    %queue,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %failure,
                    "Job failed, retry scheduled"
                );
            }
            Ok(FailOutcome::Terminal { attempts }) => {
                metrics::counter!(
                    "jobs_failed_total",
                    "queue" => queue.to_string(),
                    "outcome" => "terminal"
                )
                .increment(1);
                error!(
                    job_id = %job.id,
                    %queue,
                    attempts,
                    error = %failure,
                    "Job failed permanently"
                );
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    %queue,
                    error = %e,
                    job_error = %failure,
                    "Failed to record job failure"
                );
            }
        }
    }

    /// Run the handler in its own task so a panic only fails this job, renewing
    /// the lease until it returns.
    async fn execute_with_heartbeat(&self, job: &Job) -> Result<StageOutput, WorkerError> {
        let stop = CancellationToken::new();
        let heartbeat = {
            let broker = self.broker.clone();
            let job = job.clone();
            let stop = stop.clone();
            let period = self.config.heartbeat_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // first tick is immediate
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = broker.extend_lease(&job).await {
                                warn!(job_id = %job.id, error = %e, "Lease renewal failed");
                            }
                        }
                    }
                }
            })
        };

        let handler = self.handler.clone();
        let owned = job.clone();
        let outcome = tokio::spawn(async move { handler.handle(&owned).await }).await;

        stop.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(result) => result,
            Err(join_error) => Err(WorkerError::Panicked(join_error.to_string())),
        }
    }

    async fn commit(&self, job: &Job, output: StageOutput) -> Result<(), WorkerError> {
        for (bookmark_id, mutation) in &output.mutations {
            let found = self.store.apply(bookmark_id, mutation).await?;
            if !found {
                warn!(
                    job_id = %job.id,
                    bookmark_id = %bookmark_id,
                    mutation = mutation.describe(),
                    "Bookmark no longer exists, mutation skipped"
                );
            }
        }

        for request in output.follow_ups {
            let follow_queue = request.queue();
            let outcome = self.broker.enqueue(request).await?;
            debug!(
                job_id = %job.id,
                next_queue = %follow_queue,
                next_job_id = outcome.job_id(),
                accepted = outcome.is_accepted(),
                "Enqueued follow-up job"
            );
        }
        Ok(())
    }
}

/// Why a job attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Bookmark store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Search engine error: {0}")]
    Search(#[from] SearchError),

    #[error("Page rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Thumbnail generation failed: {0}")]
    Thumbnail(#[from] ThumbnailError),

    #[error("Job {job_id} carries a payload for the wrong queue (expected {expected})")]
    UnexpectedPayload { job_id: String, expected: QueueName },

    #[error("Scan failed for every owner: {0}")]
    ScanFailed(String),

    #[error("Job handler panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub fn unexpected_payload(job: &Job, expected: QueueName) -> Self {
        WorkerError::UnexpectedPayload {
            job_id: job.id.clone(),
            expected,
        }
    }
}
