use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::db::BookmarkStore;
use crate::services::queue::JobBroker;

/// Shared state passed to all ops route handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn JobBroker>,
    pub store: Arc<dyn BookmarkStore>,
    /// Present when a Prometheus recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(broker: Arc<dyn JobBroker>, store: Arc<dyn BookmarkStore>) -> Self {
        Self {
            broker,
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
