use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Operations API: health, metrics and queue administration.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/api/v1/jobs", post(jobs::submit_job))
        .route("/api/v1/queues/{queue}/stats", get(jobs::queue_stats))
        .route("/api/v1/queues/{queue}/jobs/{id}", get(jobs::get_job))
        .route("/api/v1/queues/{queue}/jobs/{id}/retry", post(jobs::retry_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
}
