use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::job::{EnqueueOutcome, Job, JobPayload, JobRequest, Priority, QueueName, QueueStats};
use crate::services::queue::QueueError;

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub queue: QueueName,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    /// Maintenance jobs only. Snapshot and index jobs are keyed by bookmark id.
    pub id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub job_id: String,
    pub retried: bool,
}

fn parse_queue(raw: &str) -> Result<QueueName, StatusCode> {
    raw.parse().map_err(|_| StatusCode::NOT_FOUND)
}

fn internal(e: QueueError) -> StatusCode {
    tracing::error!(error = %e, "Queue operation failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// POST /api/v1/jobs: submit a job; resubmitting an outstanding id is a no-op.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), StatusCode> {
    let payload = JobPayload::from_value(body.queue, body.payload).map_err(|e| {
        tracing::debug!(queue = %body.queue, error = %e, "Rejected malformed job payload");
        StatusCode::UNPROCESSABLE_ENTITY
    })?;

    let mut request = JobRequest::new(payload).with_priority(body.priority);
    if let Some(id) = body.id {
        request = request.with_id(id);
    }

    match state.broker.enqueue(request).await {
        Ok(outcome) => {
            metrics::counter!("jobs_submitted_total", "queue" => body.queue.to_string())
                .increment(1);
            tracing::info!(
                queue = %body.queue,
                job_id = outcome.job_id(),
                accepted = outcome.is_accepted(),
                "Job submitted"
            );
            Ok((StatusCode::ACCEPTED, Json(outcome)))
        }
        Err(QueueError::InvalidPayload { queue, reason }) => {
            tracing::debug!(%queue, %reason, "Rejected invalid job payload");
            Err(StatusCode::UNPROCESSABLE_ENTITY)
        }
        Err(e) => Err(internal(e)),
    }
}

/// GET /api/v1/queues/{queue}/stats
pub async fn queue_stats(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<Json<QueueStats>, StatusCode> {
    let queue = parse_queue(&queue)?;
    state.broker.stats(queue).await.map(Json).map_err(internal)
}

/// GET /api/v1/queues/{queue}/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<Job>, StatusCode> {
    let queue = parse_queue(&queue)?;
    state
        .broker
        .get_job(queue, &id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/v1/queues/{queue}/jobs/{id}/retry: resubmit a terminally failed job.
pub async fn retry_job(
    State(state): State<AppState>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<RetryResponse>), StatusCode> {
    let queue = parse_queue(&queue)?;
    let retried = state.broker.retry_failed(queue, &id).await.map_err(internal)?;
    if !retried {
        return Err(StatusCode::NOT_FOUND);
    }
    tracing::info!(%queue, job_id = %id, "Failed job resubmitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(RetryResponse {
            job_id: id,
            retried,
        }),
    ))
}
