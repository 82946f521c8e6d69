//! Library-wide scans: duplicate detection and broken-link checks.
//!
//! Scans tolerate partial failure. A bookmark whose snapshot cannot be read or
//! whose flag cannot be written is logged and skipped; the rest of the set is
//! still processed. Each outcome is written as soon as it is known rather than
//! returned to the runtime at the end of the job.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::index::snapshot_text;
use super::{JobHandler, StageOutput, WorkerError};
use crate::db::BookmarkStore;
use crate::models::bookmark::{Bookmark, BookmarkMutation};
use crate::models::job::{Job, JobPayload, MaintenanceKind, QueueName};
use crate::services::dedup::{find_duplicates, normalize_url, DuplicateCandidate};
use crate::services::link_check::LinkProber;
use crate::services::storage::ObjectStore;
use crate::services::text::content_hash;

/// Tally of one scan, logged when the job finishes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub flagged: usize,
    pub changed: usize,
    pub errors: usize,
}

impl ScanReport {
    fn absorb(&mut self, other: ScanReport) {
        self.scanned += other.scanned;
        self.flagged += other.flagged;
        self.changed += other.changed;
        self.errors += other.errors;
    }
}

pub struct MaintenanceHandler {
    store: Arc<dyn BookmarkStore>,
    storage: Arc<dyn ObjectStore>,
    prober: Arc<dyn LinkProber>,
    probe_delay: Duration,
}

impl MaintenanceHandler {
    pub fn new(
        store: Arc<dyn BookmarkStore>,
        storage: Arc<dyn ObjectStore>,
        prober: Arc<dyn LinkProber>,
        probe_delay: Duration,
    ) -> Self {
        Self {
            store,
            storage,
            prober,
            probe_delay,
        }
    }

    /// Run a scan over one owner or, with `None`, every owner.
    pub async fn run_scan(
        &self,
        kind: MaintenanceKind,
        owner_id: Option<&str>,
    ) -> Result<ScanReport, WorkerError> {
        let owners = match owner_id {
            Some(owner) => vec![owner.to_string()],
            None => self.store.list_owner_ids().await?,
        };

        let mut report = ScanReport::default();
        let mut failed_owners = Vec::new();
        for owner in &owners {
            let bookmarks = match self.store.list_bookmarks(owner).await {
                Ok(bookmarks) => bookmarks,
                Err(e) => {
                    tracing::warn!(owner_id = %owner, error = %e, "Failed to list bookmarks");
                    failed_owners.push(e.to_string());
                    continue;
                }
            };

            let owner_report = match kind {
                MaintenanceKind::DuplicateDetection => self.detect_duplicates(&bookmarks).await,
                MaintenanceKind::BrokenLinkScan => self.scan_links(&bookmarks).await,
            };
            report.absorb(owner_report);
        }

        if !owners.is_empty() && failed_owners.len() == owners.len() {
            return Err(WorkerError::ScanFailed(failed_owners.join("; ")));
        }
        Ok(report)
    }

    /// Flag every bookmark of one owner that shares a normalized URL or a
    /// content hash with another.
    async fn detect_duplicates(&self, bookmarks: &[Bookmark]) -> ScanReport {
        let mut report = ScanReport {
            scanned: bookmarks.len(),
            ..Default::default()
        };

        let mut candidates = Vec::with_capacity(bookmarks.len());
        for bookmark in bookmarks {
            let hash = match self.snapshot_hash(bookmark).await {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(
                        bookmark_id = %bookmark.id,
                        error = %e,
                        "Snapshot unreadable, comparing by URL only"
                    );
                    report.errors += 1;
                    None
                }
            };
            candidates.push(DuplicateCandidate {
                bookmark_id: bookmark.id.clone(),
                owner_id: bookmark.owner_id.clone(),
                normalized_url: normalize_url(&bookmark.url),
                content_hash: hash,
            });
        }

        let duplicates = find_duplicates(&candidates);
        for bookmark in bookmarks {
            let flagged = duplicates.contains(&bookmark.id);
            if flagged {
                report.flagged += 1;
            }
            if flagged != bookmark.is_duplicate {
                self.write(bookmark, BookmarkMutation::Duplicate(flagged), &mut report)
                    .await;
            }
        }
        report
    }

    async fn snapshot_hash(&self, bookmark: &Bookmark) -> Result<Option<String>, WorkerError> {
        let Some(path) = bookmark.content_snapshot_path.as_deref().filter(|p| !p.is_empty())
        else {
            return Ok(None);
        };
        let object = self.storage.download(path).await?;
        Ok(content_hash(&snapshot_text(&object, path)))
    }

    /// Probe each bookmark's URL, pausing between requests.
    async fn scan_links(&self, bookmarks: &[Bookmark]) -> ScanReport {
        let mut report = ScanReport::default();

        for (i, bookmark) in bookmarks.iter().enumerate() {
            if i > 0 && !self.probe_delay.is_zero() {
                tokio::time::sleep(self.probe_delay).await;
            }

            let health = self.prober.probe(&bookmark.url).await;
            let broken = health.is_broken();
            report.scanned += 1;
            if broken {
                report.flagged += 1;
                tracing::debug!(bookmark_id = %bookmark.id, url = %bookmark.url, ?health, "Link is broken");
            }

            if broken != bookmark.is_broken {
                self.write(bookmark, BookmarkMutation::Broken(broken), &mut report)
                    .await;
            }
        }
        report
    }

    async fn write(&self, bookmark: &Bookmark, mutation: BookmarkMutation, report: &mut ScanReport) {
        match self.store.apply(&bookmark.id, &mutation).await {
            Ok(true) => report.changed += 1,
            Ok(false) => {
                tracing::debug!(bookmark_id = %bookmark.id, "Bookmark deleted during scan");
            }
            Err(e) => {
                report.errors += 1;
                tracing::warn!(
                    bookmark_id = %bookmark.id,
                    mutation = mutation.describe(),
                    error = %e,
                    "Failed to persist scan outcome"
                );
            }
        }
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    fn queue(&self) -> QueueName {
        QueueName::Maintenance
    }

    async fn handle(&self, job: &Job) -> Result<StageOutput, WorkerError> {
        let JobPayload::Maintenance(payload) = &job.payload else {
            return Err(WorkerError::unexpected_payload(job, QueueName::Maintenance));
        };

        let report = self.run_scan(payload.kind, payload.owner_id.as_deref()).await?;
        tracing::info!(
            job_id = %job.id,
            kind = %payload.kind,
            owner_id = payload.owner_id.as_deref().unwrap_or("*"),
            scanned = report.scanned,
            flagged = report.flagged,
            changed = report.changed,
            errors = report.errors,
            "Maintenance scan finished"
        );
        Ok(StageOutput::default())
    }
}
