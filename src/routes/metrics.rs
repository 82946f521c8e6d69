use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::app_state::AppState;
use crate::models::job::QueueName;

/// Prometheus metrics scrape endpoint.
///
/// Queue depth gauges are refreshed from the broker on every scrape, so they
/// reflect all worker replicas rather than only this process.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };

    for queue in QueueName::ALL {
        match state.broker.stats(queue).await {
            Ok(stats) => {
                let name = queue.to_string();
                for (status, count) in [
                    ("waiting", stats.waiting),
                    ("delayed", stats.delayed),
                    ("active", stats.active),
                    ("completed", stats.completed),
                    ("failed", stats.failed),
                ] {
                    metrics::gauge!("queue_jobs", "queue" => name.clone(), "status" => status)
                        .set(count as f64);
                }
            }
            Err(e) => tracing::warn!(%queue, error = %e, "Failed to read queue stats"),
        }
    }

    handle.render().into_response()
}
