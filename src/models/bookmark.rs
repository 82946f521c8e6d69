use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};

/// The slice of a bookmark row the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq)]
pub struct Bookmark {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub collection_id: Option<String>,
    pub tags: Vec<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Processing state, written only by the pipeline
    pub content_snapshot_path: Option<String>,
    pub cover_url: Option<String>,
    pub content_indexed: bool,
    pub is_duplicate: bool,
    pub is_broken: bool,
}

impl Bookmark {
    pub fn has_snapshot(&self) -> bool {
        self.content_snapshot_path
            .as_deref()
            .is_some_and(|path| !path.is_empty())
    }
}

/// A write to one worker's field set on a bookmark row.
///
/// Each variant touches a disjoint set of columns, so mutations from different
/// worker types never conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkMutation {
    /// `content_snapshot_path`, `cover_url` (snapshot worker)
    SnapshotStored {
        snapshot_path: String,
        cover_url: String,
    },
    /// `content_indexed` (index worker)
    Indexed,
    /// `is_duplicate` (maintenance worker)
    Duplicate(bool),
    /// `is_broken` (maintenance worker)
    Broken(bool),
}

impl BookmarkMutation {
    pub fn describe(&self) -> &'static str {
        match self {
            BookmarkMutation::SnapshotStored { .. } => "snapshot_stored",
            BookmarkMutation::Indexed => "indexed",
            BookmarkMutation::Duplicate(_) => "duplicate_flag",
            BookmarkMutation::Broken(_) => "broken_flag",
        }
    }
}
