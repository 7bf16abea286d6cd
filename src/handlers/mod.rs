//! HTTP handlers
//!
//! - metrics_handler: Prometheus exposition of the last (or an on-demand) scrape
//! - health: liveness and per-target health

pub mod health;
pub mod metrics_handler;

use crate::scheduler::Scraper;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    pub scraper: Arc<Scraper>,
    pub handle: Arc<PrometheusHandle>,
    /// Run a full scrape for every `/metrics` request instead of serving the last snapshot
    pub on_demand: bool,
    pub metrics_path: String,
}
