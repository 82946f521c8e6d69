//! Periodic maintenance scans using tokio-cron-scheduler.
//!
//! The schedule only enqueues all-owner maintenance jobs; the maintenance
//! pool does the work.

use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::models::job::{JobPayload, JobRequest, MaintenanceKind, MaintenancePayload, Priority};
use crate::services::queue::{JobBroker, QueueError};

/// Jobs enqueued on every scheduled tick.
pub fn scheduled_requests() -> Vec<JobRequest> {
    [MaintenanceKind::DuplicateDetection, MaintenanceKind::BrokenLinkScan]
        .into_iter()
        .map(|kind| {
            JobRequest::new(JobPayload::Maintenance(MaintenancePayload {
                kind,
                owner_id: None,
            }))
            .with_priority(Priority::Low)
        })
        .collect()
}

pub async fn enqueue_scheduled_scans(broker: &dyn JobBroker) -> Result<(), QueueError> {
    for request in scheduled_requests() {
        let outcome = broker.enqueue(request).await?;
        tracing::info!(job_id = outcome.job_id(), "Scheduled maintenance scan enqueued");
    }
    Ok(())
}

/// Start a scheduler that enqueues all-owner scans on `cron` (six fields, with seconds).
pub async fn start_maintenance_schedule(
    cron: &str,
    broker: Arc<dyn JobBroker>,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let scan_job = Job::new_async(cron, move |_uuid, _lock| {
        let broker = broker.clone();
        Box::pin(async move {
            if let Err(e) = enqueue_scheduled_scans(broker.as_ref()).await {
                tracing::error!(error = %e, "Failed to enqueue scheduled maintenance");
            }
        })
    })?;

    scheduler.add(scan_job).await?;
    scheduler.start().await?;

    tracing::info!(schedule = cron, "Maintenance schedule started");
    Ok(scheduler)
}
