use bookmark_pipeline::{
    config::AppConfig,
    db::{self, BookmarkStore, PgBookmarkStore},
    models::job::QueueName,
    services::{
        browser::ManagedBrowser,
        link_check::HttpLinkProber,
        queue::{JobBroker, JobQueue},
        search::MeiliSearchClient,
        storage::{ObjectStore, S3Storage},
    },
    workers::{
        schedule, IndexHandler, JobHandler, MaintenanceHandler, PoolConfig, SnapshotHandler,
        WorkerPool,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
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

    tracing::info!("Starting bookmark pipeline worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let queues = config
        .worker_queues()
        .expect("WORKER_QUEUES contains an unknown queue name");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }
    metrics::describe_histogram!("job_duration_seconds", "Time spent processing one job attempt");
    metrics::describe_counter!("jobs_completed_total", "Jobs acknowledged as completed");
    metrics::describe_counter!("jobs_failed_total", "Failed job attempts by outcome");
    metrics::describe_counter!("browser_launches_total", "Headless browser launches");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");
    let store: Arc<dyn BookmarkStore> = Arc::new(PgBookmarkStore::new(db_pool));

    tracing::info!("Connecting to Redis job broker");
    let broker: Arc<dyn JobBroker> = Arc::new(
        JobQueue::connect(&config.redis_url, &config.queue_prefix, config.queue_settings())
            .await
            .expect("Failed to connect to job broker"),
    );

    let storage: Arc<dyn ObjectStore> = Arc::new(
        S3Storage::new(
            &config.storage_bucket,
            &config.storage_endpoint,
            &config.storage_region,
            &config.storage_access_key,
            &config.storage_secret_key,
            &config.storage_public_url,
            config.client_timeout(),
        )
        .expect("Failed to initialize object storage client"),
    );

    let shutdown = CancellationToken::new();
    let mut pools = JoinSet::new();

    for queue in queues {
        let handler: Arc<dyn JobHandler> = match queue {
            QueueName::Snapshot => Arc::new(SnapshotHandler::new(
                Arc::new(ManagedBrowser::new(
                    config.chrome_executable.clone(),
                    config.fetch_timeout(),
                )),
                storage.clone(),
            )),
            QueueName::Index => Arc::new(IndexHandler::new(
                store.clone(),
                storage.clone(),
                Arc::new(
                    MeiliSearchClient::new(
                        &config.search_url,
                        &config.search_index,
                        config.search_api_key.clone(),
                        config.client_timeout(),
                    )
                    .expect("Failed to initialize search client"),
                ),
            )),
            QueueName::Maintenance => Arc::new(MaintenanceHandler::new(
                store.clone(),
                storage.clone(),
                Arc::new(
                    HttpLinkProber::new(config.probe_timeout())
                        .expect("Failed to initialize link prober"),
                ),
                config.probe_delay(),
            )),
        };

        let pool_config = PoolConfig {
            concurrency: config.concurrency(queue),
            poll_interval: config.poll_interval(),
            ..PoolConfig::for_queue(queue, config.queue_settings().lease)
        };
        let pool = WorkerPool::new(broker.clone(), store.clone(), handler, pool_config);
        pools.spawn(pool.run(shutdown.clone()));
    }

    let mut scheduler = match &config.maintenance_schedule {
        Some(cron) => Some(
            schedule::start_maintenance_schedule(cron, broker.clone())
                .await
                .expect("Failed to start maintenance schedule"),
        ),
        None => None,
    };

    tracing::info!("Worker ready");
    wait_for_signal().await;

    tracing::info!("Shutdown requested, draining in-flight jobs");
    shutdown.cancel();
    if let Some(scheduler) = scheduler.as_mut() {
        if let Err(e) = scheduler.shutdown().await {
            tracing::warn!(error = %e, "Failed to stop maintenance schedule");
        }
    }
    while let Some(joined) = pools.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker pool task failed");
        }
    }

    tracing::info!("Worker stopped");
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
