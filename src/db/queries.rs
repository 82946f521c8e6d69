use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{BookmarkStore, StoreError};
use crate::models::bookmark::{Bookmark, BookmarkMutation};

const BOOKMARK_COLUMNS: &str = r#"
    id, owner_id, url, title, excerpt, collection_id, tags, type, created_at, updated_at,
    content_snapshot_path, cover_url, content_indexed, is_duplicate, is_broken
"#;

/// PostgreSQL-backed bookmark store.
#[derive(Clone)]
pub struct PgBookmarkStore {
    pool: PgPool,
}

impl PgBookmarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BookmarkStore for PgBookmarkStore {
    async fn get_bookmark(&self, id: &str) -> Result<Option<Bookmark>, StoreError> {
        let bookmark = sqlx::query_as::<_, Bookmark>(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(bookmark)
    }

    async fn list_bookmarks(&self, owner_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let bookmarks = sqlx::query_as::<_, Bookmark>(&format!(
            "SELECT {BOOKMARK_COLUMNS} FROM bookmarks WHERE owner_id = $1 ORDER BY created_at, id"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookmarks)
    }

    async fn list_owner_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT owner_id FROM bookmarks ORDER BY owner_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("owner_id").map_err(StoreError::from))
            .collect()
    }

    async fn highlights_text(&self, bookmark_id: &str) -> Result<String, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(string_agg(text, E'\n' ORDER BY created_at, id), '') AS joined
            FROM highlights
            WHERE bookmark_id = $1
            "#,
        )
        .bind(bookmark_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("joined")?)
    }

    async fn apply(&self, bookmark_id: &str, mutation: &BookmarkMutation) -> Result<bool, StoreError> {
        let result = match mutation {
            BookmarkMutation::SnapshotStored {
                snapshot_path,
                cover_url,
            } => {
                sqlx::query(
                    "UPDATE bookmarks SET content_snapshot_path = $2, cover_url = $3 WHERE id = $1",
                )
                .bind(bookmark_id)
                .bind(snapshot_path)
                .bind(cover_url)
                .execute(&self.pool)
                .await?
            }
            BookmarkMutation::Indexed => {
                sqlx::query("UPDATE bookmarks SET content_indexed = TRUE WHERE id = $1")
                    .bind(bookmark_id)
                    .execute(&self.pool)
                    .await?
            }
            BookmarkMutation::Duplicate(flag) => {
                sqlx::query("UPDATE bookmarks SET is_duplicate = $2 WHERE id = $1")
                    .bind(bookmark_id)
                    .bind(flag)
                    .execute(&self.pool)
                    .await?
            }
            BookmarkMutation::Broken(flag) => {
                sqlx::query("UPDATE bookmarks SET is_broken = $2 WHERE id = $1")
                    .bind(bookmark_id)
                    .bind(flag)
                    .execute(&self.pool)
                    .await?
            }
        };

        tracing::debug!(
            bookmark_id,
            mutation = mutation.describe(),
            rows = result.rows_affected(),
            "Applied bookmark mutation"
        );
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
