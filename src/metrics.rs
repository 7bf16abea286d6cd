use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder for exporter meta-metrics
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Exporter self-monitoring, named under the configured namespace
#[derive(Debug, Clone)]
pub struct ExporterMetrics {
    scrapes_total: String,
    last_scrape_duration: String,
    last_scrape_error: String,
    last_scrape_error_count: String,
    scrape_errors_total: String,
    definition_reloads_total: String,
    log_lines_total: String,
}

impl ExporterMetrics {
    pub fn new(namespace: &str) -> Self {
        let name = |suffix: &str| format!("{}_exporter_{}", namespace, suffix);
        let metrics = Self {
            scrapes_total: name("scrapes_total"),
            last_scrape_duration: name("last_scrape_duration_seconds"),
            last_scrape_error: name("last_scrape_error"),
            last_scrape_error_count: name("last_scrape_error_count"),
            scrape_errors_total: name("scrape_errors_total"),
            definition_reloads_total: name("definition_reloads_total"),
            log_lines_total: name("log_lines_total"),
        };
        metrics.describe();
        metrics
    }

    /// Describe all metrics (can be called multiple times safely)
    fn describe(&self) {
        describe_counter!(
            self.scrapes_total.clone(),
            "Total number of times the databases were scraped for metrics"
        );
        describe_gauge!(
            self.last_scrape_duration.clone(),
            "Duration of the last scrape of metrics from the databases"
        );
        describe_gauge!(
            self.last_scrape_error.clone(),
            "Whether the last scrape of metrics resulted in an error (1 for error, 0 for success)"
        );
        describe_gauge!(
            self.last_scrape_error_count.clone(),
            "Number of metric computations that failed during the last scrape"
        );
        describe_counter!(
            self.scrape_errors_total.clone(),
            "Total number of errors while scraping, by metric context"
        );
        describe_counter!(
            self.definition_reloads_total.clone(),
            "Total number of metric definition reloads"
        );
        describe_counter!(
            self.log_lines_total.clone(),
            "Total number of log records appended, by database"
        );
    }

    /// Finalize one tick
    pub fn record_tick(&self, duration: Duration, errors: usize) {
        counter!(self.scrapes_total.clone()).increment(1);
        gauge!(self.last_scrape_duration.clone()).set(duration.as_secs_f64());
        gauge!(self.last_scrape_error.clone()).set(if errors > 0 { 1.0 } else { 0.0 });
        gauge!(self.last_scrape_error_count.clone()).set(errors as f64);
    }

    pub fn record_scrape_error(&self, context: &str) {
        counter!(self.scrape_errors_total.clone(), "collector" => context.to_string()).increment(1);
    }

    pub fn record_definition_reload(&self) {
        counter!(self.definition_reloads_total.clone()).increment(1);
    }

    pub fn record_log_lines(&self, database: &str, lines: usize) {
        counter!(self.log_lines_total.clone(), "database" => database.to_string())
            .increment(lines as u64);
    }
}
