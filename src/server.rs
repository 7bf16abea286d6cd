use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    connection::{ConnectionManager, ConnectionSettings},
    definition::DefinitionStore,
    handlers::{self, AppState},
    metrics,
    scheduler::Scraper,
    session::Connector,
    signals::setup_signal_handlers,
    sqlx_session::SqlxConnector,
    tailer::LogTailer,
};

/// Start the exporter
///
/// This function:
/// 1. Initializes meta-metrics
/// 2. Opens and warms up one session per target
/// 3. Loads metric definitions
/// 4. Starts the scrape scheduler (unless scraping on demand) and the log tailer
/// 5. Serves HTTP with graceful shutdown support
pub async fn start_server(config: Config) -> Result<()> {
    start_server_with(config, Arc::new(SqlxConnector::new())).await
}

pub async fn start_server_with(config: Config, connector: Arc<dyn Connector>) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let connections = Arc::new(ConnectionManager::new(
        &config.targets,
        &config.metrics.database_label,
        connector,
        ConnectionSettings::with_backoff(config.metrics.connection_backoff()),
    ));
    connections.warm_up_all().await;

    let store = DefinitionStore::new(config.metrics.definition_sources());
    let scraper = Arc::new(Scraper::new(connections.clone(), store, &config.metrics.namespace));

    // SIGTERM/SIGINT for shutdown; SIGHUP for definition reload
    let (shutdown_tx, signal_handle) = setup_signal_handlers(scraper.clone())?;
    let mut shutdown_rx = shutdown_tx.subscribe();

    let scrape_interval = config.metrics.scrape_interval();
    let scheduler_handle = scrape_interval.map(|interval| {
        tokio::spawn(scraper.clone().run(interval, shutdown_tx.subscribe()))
    });
    if scrape_interval.is_none() {
        info!("Scraping on demand for every metrics request");
    }

    let tailer_handle = if config.log.enabled {
        let tailer = Arc::new(LogTailer::new(
            connections.clone(),
            config.log.clone(),
            scraper.metrics().clone(),
        ));
        Some(tokio::spawn(tailer.run(shutdown_tx.subscribe())))
    } else {
        None
    };

    let state = AppState {
        scraper: scraper.clone(),
        handle: metrics_handle,
        on_demand: scrape_interval.is_none(),
        metrics_path: config.server.metrics_path.clone(),
    };
    let app = create_router(state);

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .with_context(|| format!("Invalid server host: {}", config.server.host))?,
        config.server.port,
    ));

    info!("Starting dbmon on {}", addr);
    info!(
        "Configuration: {} targets, {} metric definitions, log tailing {}",
        config.targets.len(),
        scraper.plan().set.len(),
        if config.log.enabled { "enabled" } else { "disabled" }
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    if let Some(handle) = scheduler_handle {
        handle.await?;
    }
    if let Some(handle) = tailer_handle {
        handle.await?;
    }
    signal_handle.await?;
    info!("Exporter stopped gracefully");

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route("/", get(handlers::health::index))
        .route("/health", get(handlers::health::health_check))
        .route(&metrics_path, get(handlers::metrics_handler::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
