use serde::{Deserialize, Serialize};

use crate::models::bookmark::Bookmark;

/// Document upserted into the search engine for one bookmark.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub id: String,
    pub owner_id: String,
    pub collection_id: Option<String>,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub excerpt: String,
    pub content: String,
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
    pub has_snapshot: bool,
    pub highlights_text: String,
}

impl SearchDocument {
    /// Combine bookmark metadata, highlight text and cleaned body text.
    pub fn build(bookmark: &Bookmark, highlights_text: String, content: String) -> Self {
        Self {
            id: bookmark.id.clone(),
            owner_id: bookmark.owner_id.clone(),
            collection_id: bookmark.collection_id.clone(),
            title: bookmark.title.clone().unwrap_or_default(),
            url: bookmark.url.clone(),
            domain: domain_of(&bookmark.url),
            excerpt: bookmark.excerpt.clone().unwrap_or_default(),
            content,
            tags: bookmark.tags.clone(),
            kind: bookmark.kind.clone(),
            created_at: bookmark.created_at.timestamp(),
            updated_at: bookmark.updated_at.timestamp(),
            has_snapshot: bookmark.has_snapshot(),
            highlights_text,
        }
    }
}

/// Host of a URL without a leading `www.`; empty when the URL has no host.
pub fn domain_of(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
        .unwrap_or_default()
}
