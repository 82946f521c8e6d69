use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Named queues served by the pipeline.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueueName {
    Snapshot,
    Index,
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Snapshot, QueueName::Index, QueueName::Maintenance];

    /// Attempt budget for jobs on this queue.
    pub fn max_attempts(self) -> u32 {
        match self {
            QueueName::Snapshot | QueueName::Index => 3,
            QueueName::Maintenance => 2,
        }
    }

    /// Default number of concurrent executors for this queue's worker pool.
    pub fn default_concurrency(self) -> usize {
        match self {
            QueueName::Snapshot | QueueName::Index => 5,
            QueueName::Maintenance => 3,
        }
    }
}

/// Job priority tier. Lower numeric value is served first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq,
    PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn value(self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }

    pub fn from_value(value: u8) -> Self {
        match value {
            0..=1 => Priority::High,
            2..=5 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Lifecycle state of a job inside the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    /// Failed with attempts remaining; becomes `Waiting` once the backoff delay elapses.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether a job in this state blocks a new submission with the same id.
    pub fn is_outstanding(self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed | JobStatus::Active)
    }
}

/// Archive a bookmarked page.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    #[garde(length(min = 1, max = 128))]
    pub bookmark_id: String,

    #[garde(url, custom(is_fetchable_url))]
    pub url: String,

    #[garde(length(min = 1, max = 128))]
    pub owner_id: String,

    #[garde(length(min = 1, max = 64))]
    pub owner_plan: String,
}

/// Make an archived snapshot searchable.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexPayload {
    #[garde(length(min = 1, max = 128))]
    pub bookmark_id: String,

    #[garde(length(min = 1, max = 1024))]
    pub snapshot_path: String,

    #[garde(length(min = 1, max = 128))]
    pub owner_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MaintenanceKind {
    DuplicateDetection,
    BrokenLinkScan,
}

/// Scan one owner's bookmarks, or every owner's when `owner_id` is absent.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePayload {
    #[serde(rename = "type")]
    #[garde(skip)]
    pub kind: MaintenanceKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(length(min = 1, max = 128))]
    pub owner_id: Option<String>,
}

/// Queue-specific job body. The variant determines the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Snapshot(SnapshotPayload),
    Index(IndexPayload),
    Maintenance(MaintenancePayload),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Snapshot(_) => QueueName::Snapshot,
            JobPayload::Index(_) => QueueName::Index,
            JobPayload::Maintenance(_) => QueueName::Maintenance,
        }
    }

    /// The bookmark a snapshot or index job works on.
    pub fn bookmark_id(&self) -> Option<&str> {
        match self {
            JobPayload::Snapshot(p) => Some(&p.bookmark_id),
            JobPayload::Index(p) => Some(&p.bookmark_id),
            JobPayload::Maintenance(_) => None,
        }
    }

    /// Validate the payload against its queue schema.
    pub fn validate(&self) -> Result<(), garde::Report> {
        match self {
            JobPayload::Snapshot(p) => p.validate(),
            JobPayload::Index(p) => p.validate(),
            JobPayload::Maintenance(p) => p.validate(),
        }
    }

    /// Serialize the variant body in its wire shape (no queue tag).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            JobPayload::Snapshot(p) => serde_json::to_string(p),
            JobPayload::Index(p) => serde_json::to_string(p),
            JobPayload::Maintenance(p) => serde_json::to_string(p),
        }
    }

    pub fn from_json(queue: QueueName, raw: &str) -> Result<Self, serde_json::Error> {
        Ok(match queue {
            QueueName::Snapshot => JobPayload::Snapshot(serde_json::from_str(raw)?),
            QueueName::Index => JobPayload::Index(serde_json::from_str(raw)?),
            QueueName::Maintenance => JobPayload::Maintenance(serde_json::from_str(raw)?),
        })
    }

    pub fn from_value(queue: QueueName, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match queue {
            QueueName::Snapshot => JobPayload::Snapshot(serde_json::from_value(value)?),
            QueueName::Index => JobPayload::Index(serde_json::from_value(value)?),
            QueueName::Maintenance => JobPayload::Maintenance(serde_json::from_value(value)?),
        })
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            JobPayload::Snapshot(p) => serde_json::to_value(p),
            JobPayload::Index(p) => serde_json::to_value(p),
            JobPayload::Maintenance(p) => serde_json::to_value(p),
        }
    }
}

impl Serialize for JobPayload {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JobPayload::Snapshot(p) => p.serialize(serializer),
            JobPayload::Index(p) => p.serialize(serializer),
            JobPayload::Maintenance(p) => p.serialize(serializer),
        }
    }
}

/// A request to put work on a queue.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: String,
    pub payload: JobPayload,
    pub priority: Priority,
}

impl JobRequest {
    /// Build a request with the queue's default id scheme: the bookmark id for
    /// snapshot and index jobs, a generated id for maintenance scans.
    pub fn new(payload: JobPayload) -> Self {
        let id = match &payload {
            JobPayload::Snapshot(p) => p.bookmark_id.clone(),
            JobPayload::Index(p) => p.bookmark_id.clone(),
            JobPayload::Maintenance(_) => uuid::Uuid::new_v4().to_string(),
        };
        Self {
            id,
            payload,
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn queue(&self) -> QueueName {
        self.payload.queue()
    }
}

/// A job as tracked by the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: JobPayload,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Lease held by the worker currently processing the job.
    #[serde(skip)]
    pub lease_token: Option<String>,
}

impl Job {
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Result of submitting a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "jobId", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Accepted(String),
    /// A job with the same id is already waiting or active; its id is returned.
    Deduplicated(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Accepted(id) | EnqueueOutcome::Deduplicated(id) => id,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, EnqueueOutcome::Accepted(_))
    }
}

/// What the broker decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempt: u32, delay: std::time::Duration },
    Terminal { attempts: u32 },
}

/// Per-queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

fn is_fetchable_url(value: &str, _ctx: &()) -> garde::Result {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.host().is_some() => {
            Ok(())
        }
        _ => Err(garde::Error::new("url must be an absolute http(s) URL")),
    }
}
