use async_trait::async_trait;
use std::sync::Arc;

use super::{JobHandler, StageOutput, WorkerError};
use crate::models::bookmark::BookmarkMutation;
use crate::models::job::{IndexPayload, Job, JobPayload, JobRequest, Priority, QueueName};
use crate::services::browser::PageRenderer;
use crate::services::extract;
use crate::services::storage::{ObjectStore, SnapshotKeys};
use crate::services::thumbnail;

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Archives a bookmarked page: render, strip boilerplate, thumbnail, store.
///
/// Nothing is written to the bookmark until both objects are stored; the
/// runtime then records the paths and queues the index job.
pub struct SnapshotHandler {
    renderer: Arc<dyn PageRenderer>,
    storage: Arc<dyn ObjectStore>,
}

impl SnapshotHandler {
    /// `renderer` owns the fetch timeout.
    pub fn new(renderer: Arc<dyn PageRenderer>, storage: Arc<dyn ObjectStore>) -> Self {
        Self { renderer, storage }
    }
}

#[async_trait]
impl JobHandler for SnapshotHandler {
    fn queue(&self) -> QueueName {
        QueueName::Snapshot
    }

    async fn handle(&self, job: &Job) -> Result<StageOutput, WorkerError> {
        let JobPayload::Snapshot(payload) = &job.payload else {
            return Err(WorkerError::unexpected_payload(job, QueueName::Snapshot));
        };

        let rendered = self.renderer.render(&payload.url).await?;

        let archive = extract::archive_html(&rendered.html, &rendered.final_url);
        let thumbnail = thumbnail::make_thumbnail(&rendered.screenshot)?;

        tracing::debug!(
            job_id = %job.id,
            bookmark_id = %payload.bookmark_id,
            final_url = %rendered.final_url,
            main_content = archive.main_content,
            html_bytes = archive.html.len(),
            thumbnail_bytes = thumbnail.len(),
            "Page archived"
        );

        let keys = SnapshotKeys::new(&payload.owner_id, &payload.bookmark_id);
        self.storage
            .upload(&keys.page, archive.html.as_bytes(), HTML_CONTENT_TYPE)
            .await?;
        self.storage
            .upload(&keys.thumbnail, &thumbnail, THUMBNAIL_CONTENT_TYPE)
            .await?;

        let cover_url = self.storage.public_url(&keys.thumbnail);
        let index = JobRequest::new(JobPayload::Index(IndexPayload {
            bookmark_id: payload.bookmark_id.clone(),
            snapshot_path: keys.page.clone(),
            owner_id: payload.owner_id.clone(),
        }))
        .with_priority(Priority::Normal);

        Ok(StageOutput::default()
            .mutate(
                &payload.bookmark_id,
                BookmarkMutation::SnapshotStored {
                    snapshot_path: keys.page,
                    cover_url,
                },
            )
            .then(index))
    }

    async fn shutdown(&self) {
        self.renderer.shutdown().await;
    }
}
