use serde::Deserialize;
use std::time::Duration;

use crate::models::job::QueueName;
use crate::services::queue::QueueSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus listener for worker processes (e.g., "0.0.0.0:9100")
    pub worker_metrics_addr: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Redis connection string for the job broker
    pub redis_url: String,

    /// Key prefix for all broker keys in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Dequeues admitted per queue per second
    #[serde(default = "default_queue_rate_limit")]
    pub queue_rate_limit: u32,

    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,

    /// How long completed and failed jobs stay visible
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Comma-separated queues this worker process consumes
    #[serde(default = "default_worker_queues")]
    pub worker_queues: String,

    pub snapshot_concurrency: Option<usize>,
    pub index_concurrency: Option<usize>,
    pub maintenance_concurrency: Option<usize>,

    /// S3-compatible bucket for snapshots and thumbnails
    pub storage_bucket: String,
    pub storage_endpoint: String,
    #[serde(default = "default_storage_region")]
    pub storage_region: String,
    pub storage_access_key: String,
    pub storage_secret_key: String,
    /// Base URL thumbnails are served from
    pub storage_public_url: String,

    /// Search engine base URL
    pub search_url: String,
    pub search_api_key: Option<String>,
    #[serde(default = "default_search_index")]
    pub search_index: String,

    /// Hard limit for fetching and rendering one page
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Pause between consecutive link probes in one scan
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,

    /// Timeout for storage and search client calls
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Chromium binary; auto-detected when unset
    pub chrome_executable: Option<String>,

    /// Cron expression (with seconds) for all-owner maintenance scans
    pub maintenance_schedule: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_queue_prefix() -> String {
    "bookmarks".to_string()
}

fn default_queue_rate_limit() -> u32 {
    10
}

fn default_job_lease_secs() -> u64 {
    120
}

fn default_job_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_queues() -> String {
    "snapshot,index,maintenance".to_string()
}

fn default_storage_region() -> String {
    "auto".to_string()
}

fn default_search_index() -> String {
    "bookmarks".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_probe_delay_ms() -> u64 {
    100
}

fn default_client_timeout_secs() -> u64 {
    15
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            rate_limit_per_sec: self.queue_rate_limit,
            lease: Duration::from_secs(self.job_lease_secs),
            retention: Duration::from_secs(self.job_retention_secs),
        }
    }

    /// Queues named in `WORKER_QUEUES`; unknown names are an error.
    pub fn worker_queues(&self) -> Result<Vec<QueueName>, strum::ParseError> {
        self.worker_queues
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::parse)
            .collect()
    }

    pub fn concurrency(&self, queue: QueueName) -> usize {
        let configured = match queue {
            QueueName::Snapshot => self.snapshot_concurrency,
            QueueName::Index => self.index_concurrency,
            QueueName::Maintenance => self.maintenance_concurrency,
        };
        configured
            .filter(|n| *n > 0)
            .unwrap_or_else(|| queue.default_concurrency())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}
