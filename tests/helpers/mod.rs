//! Test harness wiring the worker pools to in-memory collaborators.

#![allow(dead_code)]

use bookmark_pipeline::{
    models::job::{
        IndexPayload, Job, JobPayload, JobRequest, MaintenanceKind, MaintenancePayload, QueueName,
        SnapshotPayload,
    },
    services::{
        link_check::LinkProber,
        queue::{JobBroker, MemoryJobQueue, QueueSettings},
    },
    workers::{
        IndexHandler, JobHandler, MaintenanceHandler, PoolConfig, SnapshotHandler, WorkerPool,
    },
};
use std::sync::Arc;
use std::time::Duration;

pub mod doubles;

pub use doubles::{
    bookmark, MemoryBookmarkStore, MemoryObjectStore, MemorySearchIndex, StaticProber,
    StaticRenderer,
};

pub const ARTICLE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Understanding Ownership</title>
  <script>window.analytics = "tracking-secret";</script>
  <style>body { font-family: serif; }</style>
</head>
<body>
  <nav><a href="/">Home</a> <a href="/blog">Blog</a></nav>
  <article>
    <h1>Understanding Ownership</h1>
    <p>Ownership is a set of rules that govern how a program manages memory.
       Some languages have garbage collection that regularly looks for no-longer-used
       memory as the program runs; in other languages, the programmer must explicitly
       allocate and free the memory.</p>
    <p>Rust uses a third approach: memory is managed through a system of ownership
       with a set of rules that the compiler checks.</p>
    <div class="ads">Sponsored: buy more RAM</div>
  </article>
  <footer>Copyright 2024 Example Blog</footer>
</body>
</html>"#;

pub struct Harness {
    pub broker: Arc<MemoryJobQueue>,
    pub store: Arc<MemoryBookmarkStore>,
    pub storage: Arc<MemoryObjectStore>,
    pub search: Arc<MemorySearchIndex>,
    pub renderer: Arc<StaticRenderer>,
    pub prober: Arc<StaticProber>,
    pub probe_delay: Duration,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: Arc::new(MemoryJobQueue::new(QueueSettings {
                rate_limit_per_sec: 10_000,
                ..QueueSettings::default()
            })),
            store: Arc::new(MemoryBookmarkStore::new()),
            storage: Arc::new(MemoryObjectStore::default()),
            search: Arc::new(MemorySearchIndex::new()),
            renderer: Arc::new(StaticRenderer::new()),
            prober: Arc::new(StaticProber::new()),
            probe_delay: Duration::ZERO,
        }
    }

    pub fn handler(&self, queue: QueueName) -> Arc<dyn JobHandler> {
        self.handler_with_prober(queue, self.prober.clone())
    }

    pub fn handler_with_prober(
        &self,
        queue: QueueName,
        prober: Arc<dyn LinkProber>,
    ) -> Arc<dyn JobHandler> {
        match queue {
            QueueName::Snapshot => Arc::new(SnapshotHandler::new(
                self.renderer.clone(),
                self.storage.clone(),
            )),
            QueueName::Index => Arc::new(IndexHandler::new(
                self.store.clone(),
                self.storage.clone(),
                self.search.clone(),
            )),
            QueueName::Maintenance => Arc::new(MaintenanceHandler::new(
                self.store.clone(),
                self.storage.clone(),
                prober,
                self.probe_delay,
            )),
        }
    }

    pub fn pool(&self, queue: QueueName) -> WorkerPool {
        self.pool_with(self.handler(queue))
    }

    pub fn pool_with(&self, handler: Arc<dyn JobHandler>) -> WorkerPool {
        let queue = handler.queue();
        WorkerPool::new(
            self.broker.clone(),
            self.store.clone(),
            handler,
            PoolConfig {
                poll_interval: Duration::from_millis(10),
                ..PoolConfig::for_queue(queue, Duration::from_secs(120))
            },
        )
    }

    /// Lease the next job on `queue` and process it with a fresh pool.
    pub async fn run_next(&self, queue: QueueName) -> Option<Job> {
        let job = self.broker.dequeue(queue).await.unwrap()?;
        self.pool(queue).process(job.clone()).await;
        Some(job)
    }

    pub async fn run_next_with(&self, handler: Arc<dyn JobHandler>) -> Option<Job> {
        let job = self.broker.dequeue(handler.queue()).await.unwrap()?;
        self.pool_with(handler).process(job.clone()).await;
        Some(job)
    }
}

pub fn snapshot_request(bookmark_id: &str, owner_id: &str, url: &str) -> JobRequest {
    JobRequest::new(JobPayload::Snapshot(SnapshotPayload {
        bookmark_id: bookmark_id.to_string(),
        url: url.to_string(),
        owner_id: owner_id.to_string(),
        owner_plan: "pro".to_string(),
    }))
}

pub fn index_request(bookmark_id: &str, owner_id: &str, snapshot_path: &str) -> JobRequest {
    JobRequest::new(JobPayload::Index(IndexPayload {
        bookmark_id: bookmark_id.to_string(),
        snapshot_path: snapshot_path.to_string(),
        owner_id: owner_id.to_string(),
    }))
}

pub fn maintenance_request(kind: MaintenanceKind, owner_id: Option<&str>) -> JobRequest {
    JobRequest::new(JobPayload::Maintenance(MaintenancePayload {
        kind,
        owner_id: owner_id.map(str::to_string),
    }))
}
