use async_trait::async_trait;
use std::sync::Arc;

use super::{JobHandler, StageOutput, WorkerError};
use crate::db::BookmarkStore;
use crate::models::bookmark::BookmarkMutation;
use crate::models::job::{Job, JobPayload, QueueName};
use crate::models::search::SearchDocument;
use crate::services::extract::{self, ContentKind};
use crate::services::search::SearchIndex;
use crate::services::storage::{ObjectStore, StoredObject};
use crate::services::text::clean_text;

/// Makes an archived snapshot searchable and marks the bookmark indexed.
pub struct IndexHandler {
    store: Arc<dyn BookmarkStore>,
    storage: Arc<dyn ObjectStore>,
    search: Arc<dyn SearchIndex>,
}

impl IndexHandler {
    pub fn new(
        store: Arc<dyn BookmarkStore>,
        storage: Arc<dyn ObjectStore>,
        search: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            store,
            storage,
            search,
        }
    }
}

/// Cleaned text of a stored snapshot.
///
/// Content that cannot be parsed yields an empty string; an unindexable page
/// is a valid outcome, not a failure.
pub fn snapshot_text(object: &StoredObject, key: &str) -> String {
    match ContentKind::detect(object.content_type.as_deref(), key, &object.bytes) {
        ContentKind::Html => clean_text(&extract::visible_text(&String::from_utf8_lossy(
            &object.bytes,
        ))),
        ContentKind::Pdf => match extract::pdf_text(&object.bytes) {
            Ok(text) => clean_text(&text),
            Err(e) => {
                tracing::warn!(key, error = %e, "No text layer extracted from PDF snapshot");
                String::new()
            }
        },
    }
}

#[async_trait]
impl JobHandler for IndexHandler {
    fn queue(&self) -> QueueName {
        QueueName::Index
    }

    async fn handle(&self, job: &Job) -> Result<StageOutput, WorkerError> {
        let JobPayload::Index(payload) = &job.payload else {
            return Err(WorkerError::unexpected_payload(job, QueueName::Index));
        };

        let Some(bookmark) = self.store.get_bookmark(&payload.bookmark_id).await? else {
            tracing::warn!(
                job_id = %job.id,
                bookmark_id = %payload.bookmark_id,
                "Bookmark deleted before indexing, removing search document"
            );
            self.search.delete(&payload.bookmark_id).await?;
            return Ok(StageOutput::default());
        };

        let object = self.storage.download(&payload.snapshot_path).await?;
        let content = snapshot_text(&object, &payload.snapshot_path);
        if content.is_empty() {
            tracing::info!(
                job_id = %job.id,
                bookmark_id = %payload.bookmark_id,
                "Snapshot has no extractable text, indexing metadata only"
            );
        }

        let highlights = self.store.highlights_text(&bookmark.id).await?;
        let document = SearchDocument::build(&bookmark, highlights, content);
        self.search.upsert(&document).await?;

        tracing::debug!(
            job_id = %job.id,
            bookmark_id = %bookmark.id,
            content_chars = document.content.len(),
            "Search document upserted"
        );

        Ok(StageOutput::default().mutate(&bookmark.id, BookmarkMutation::Indexed))
    }
}
