use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::bookmark::{Bookmark, BookmarkMutation};

pub mod queries;

pub use self::queries::PgBookmarkStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Bookmark records as seen by the pipeline.
///
/// Reads cover the metadata needed to build archives and search documents;
/// writes are limited to the processing fields in [`BookmarkMutation`].
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    async fn get_bookmark(&self, id: &str) -> Result<Option<Bookmark>, StoreError>;

    /// All bookmarks of one owner, oldest first.
    async fn list_bookmarks(&self, owner_id: &str) -> Result<Vec<Bookmark>, StoreError>;

    async fn list_owner_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Highlight text of a bookmark joined with newlines, empty when there is none.
    async fn highlights_text(&self, bookmark_id: &str) -> Result<String, StoreError>;

    /// Apply a processing-state write. Returns `false` when the bookmark no longer exists.
    async fn apply(&self, bookmark_id: &str, mutation: &BookmarkMutation) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
