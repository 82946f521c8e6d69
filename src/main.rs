use bookmark_pipeline::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgBookmarkStore},
    routes,
    services::queue::JobQueue,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing bookmark pipeline ops server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_gauge!("queue_jobs", "Jobs per queue and status");
    metrics::describe_counter!("jobs_submitted_total", "Jobs submitted through the ops API");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis job broker");
    let broker = JobQueue::connect(&config.redis_url, &config.queue_prefix, config.queue_settings())
        .await
        .expect("Failed to connect to job broker");

    let state = AppState::new(Arc::new(broker), Arc::new(PgBookmarkStore::new(db_pool)))
        .with_metrics(prometheus_handle);

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
