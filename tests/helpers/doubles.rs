//! In-memory collaborators for the worker and API tests.
//!
//! Each double records what the pipeline did to it so tests can assert on
//! effects without PostgreSQL, object storage, a search engine or a browser.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use bookmark_pipeline::db::{BookmarkStore, StoreError};
use bookmark_pipeline::models::bookmark::{Bookmark, BookmarkMutation};
use bookmark_pipeline::models::search::SearchDocument;
use bookmark_pipeline::services::browser::{PageRenderer, RenderError, RenderedPage};
use bookmark_pipeline::services::link_check::{LinkHealth, LinkProber};
use bookmark_pipeline::services::search::{SearchError, SearchIndex};
use bookmark_pipeline::services::storage::{ObjectStore, StorageError, StoredObject};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A bookmark with empty processing state, created `minute` minutes after a fixed epoch.
pub fn bookmark(id: &str, owner_id: &str, url: &str, minute: i64) -> Bookmark {
    let created = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
        + chrono::Duration::minutes(minute);
    Bookmark {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        url: url.to_string(),
        title: Some(format!("Bookmark {id}")),
        excerpt: None,
        collection_id: None,
        tags: Vec::new(),
        kind: "link".to_string(),
        created_at: created,
        updated_at: created,
        content_snapshot_path: None,
        cover_url: None,
        content_indexed: false,
        is_duplicate: false,
        is_broken: false,
    }
}

/// A solid-colour PNG standing in for a browser screenshot.
pub fn screenshot_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([32, 96, 160]));
    let mut buf = Cursor::new(Vec::new());
    match image::DynamicImage::ImageRgb8(img).write_to(&mut buf, image::ImageFormat::Png) {
        Ok(()) => buf.into_inner(),
        Err(_) => Vec::new(),
    }
}

#[derive(Default)]
pub struct MemoryBookmarkStore {
    bookmarks: Mutex<HashMap<String, Bookmark>>,
    highlights: Mutex<HashMap<String, Vec<String>>>,
    applied: Mutex<Vec<(String, BookmarkMutation)>>,
    failing_writes: Mutex<HashSet<String>>,
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bookmark: Bookmark) {
        lock(&self.bookmarks).insert(bookmark.id.clone(), bookmark);
    }

    pub fn remove(&self, id: &str) {
        lock(&self.bookmarks).remove(id);
    }

    pub fn add_highlight(&self, bookmark_id: &str, text: &str) {
        lock(&self.highlights)
            .entry(bookmark_id.to_string())
            .or_default()
            .push(text.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Bookmark> {
        lock(&self.bookmarks).get(id).cloned()
    }

    /// Every successful write, in order.
    pub fn applied(&self) -> Vec<(String, BookmarkMutation)> {
        lock(&self.applied).clone()
    }

    /// Make writes to this bookmark fail with a database error.
    pub fn fail_writes_for(&self, id: &str) {
        lock(&self.failing_writes).insert(id.to_string());
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn get_bookmark(&self, id: &str) -> Result<Option<Bookmark>, StoreError> {
        Ok(self.get(id))
    }

    async fn list_bookmarks(&self, owner_id: &str) -> Result<Vec<Bookmark>, StoreError> {
        let mut owned: Vec<Bookmark> = lock(&self.bookmarks)
            .values()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(owned)
    }

    async fn list_owner_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut owners: Vec<String> = lock(&self.bookmarks)
            .values()
            .map(|b| b.owner_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        owners.sort();
        Ok(owners)
    }

    async fn highlights_text(&self, bookmark_id: &str) -> Result<String, StoreError> {
        Ok(lock(&self.highlights)
            .get(bookmark_id)
            .map(|texts| texts.join("\n"))
            .unwrap_or_default())
    }

    async fn apply(&self, bookmark_id: &str, mutation: &BookmarkMutation) -> Result<bool, StoreError> {
        if lock(&self.failing_writes).contains(bookmark_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut bookmarks = lock(&self.bookmarks);
        let Some(bookmark) = bookmarks.get_mut(bookmark_id) else {
            return Ok(false);
        };
        match mutation {
            BookmarkMutation::SnapshotStored {
                snapshot_path,
                cover_url,
            } => {
                bookmark.content_snapshot_path = Some(snapshot_path.clone());
                bookmark.cover_url = Some(cover_url.clone());
            }
            BookmarkMutation::Indexed => bookmark.content_indexed = true,
            BookmarkMutation::Duplicate(flag) => bookmark.is_duplicate = *flag,
            BookmarkMutation::Broken(flag) => bookmark.is_broken = *flag,
        }
        lock(&self.applied).push((bookmark_id.to_string(), mutation.clone()));
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    public_base_url: String,
    fail_uploads: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            fail_uploads: AtomicBool::new(false),
        }
    }

    pub fn put(&self, key: &str, bytes: &[u8], content_type: &str) {
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: Some(content_type.to_string()),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Simulate an unavailable bucket.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("https://cdn.test")
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        self.put(key, data, content_type);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[derive(Default)]
pub struct MemorySearchIndex {
    documents: Mutex<HashMap<String, SearchDocument>>,
    deleted: Mutex<Vec<String>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, id: &str) -> Option<SearchDocument> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> Result<(), SearchError> {
        lock(&self.documents).insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        lock(&self.documents).remove(id);
        lock(&self.deleted).push(id.to_string());
        Ok(())
    }
}

/// Serves canned pages by URL.
///
/// Unknown URLs fail like a network error. URLs registered with
/// [`StaticRenderer::panic_on`] make the render panic.
#[derive(Default)]
pub struct StaticRenderer {
    pages: Mutex<HashMap<String, RenderedPage>>,
    panics: Mutex<HashSet<String>>,
    renders: AtomicUsize,
    shut_down: AtomicBool,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, html: &str) {
        lock(&self.pages).insert(
            url.to_string(),
            RenderedPage {
                html: html.to_string(),
                screenshot: screenshot_png(1280, 800),
                final_url: url.to_string(),
            },
        );
    }

    pub fn redirect(&self, url: &str, final_url: &str, html: &str) {
        self.page(url, html);
        if let Some(page) = lock(&self.pages).get_mut(url) {
            page.final_url = final_url.to_string();
        }
    }

    pub fn panic_on(&self, url: &str) {
        lock(&self.panics).insert(url.to_string());
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageRenderer for StaticRenderer {
    async fn render(&self, url: &str) -> Result<RenderedPage, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if lock(&self.panics).contains(url) {
            panic!("renderer crashed on {url}");
        }
        lock(&self.pages)
            .get(url)
            .cloned()
            .ok_or_else(|| RenderError::Launch(format!("net::ERR_NAME_NOT_RESOLVED at {url}")))
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Answers link probes from a table; unknown URLs are alive.
#[derive(Default)]
pub struct StaticProber {
    answers: Mutex<HashMap<String, LinkHealth>>,
    probed: Mutex<Vec<String>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, url: &str, health: LinkHealth) {
        lock(&self.answers).insert(url.to_string(), health);
    }

    pub fn probed(&self) -> Vec<String> {
        lock(&self.probed).clone()
    }
}

#[async_trait]
impl LinkProber for StaticProber {
    async fn probe(&self, url: &str) -> LinkHealth {
        lock(&self.probed).push(url.to_string());
        lock(&self.answers)
            .get(url)
            .cloned()
            .unwrap_or(LinkHealth::Alive(200))
    }
}
