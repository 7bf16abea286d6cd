//! Scrape scheduler: drives ticks, decides what is due, fans work out and
//! publishes one complete snapshot per tick.

use crate::cache::MetricCache;
use crate::connection::{ConnectionManager, Health, Target};
use crate::definition::{DefinitionSet, DefinitionStore, MetricDefinition};
use crate::error::ScrapeError;
use crate::metrics::ExporterMetrics;
use crate::observation::{fq_name, Observation};
use crate::pipeline::scrape_metric;
use crate::signals::ShutdownSignal;
use arc_swap::ArcSwap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

// ============================================================
// Data Structures
// ============================================================

/// Observations published by the last completed tick
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub observations: Vec<Observation>,
    /// Number of failed metric computations in that tick
    pub errors: usize,
    pub completed_at: Option<Instant>,
}

/// Definitions applicable to each target, rebuilt on every reload
#[derive(Debug, Default)]
pub struct Plan {
    pub set: DefinitionSet,
    per_target: HashMap<String, Vec<Arc<MetricDefinition>>>,
}

impl Plan {
    pub fn build(set: DefinitionSet, targets: &[Arc<Target>]) -> Self {
        let mut per_target = HashMap::new();
        for target in targets {
            let mut definitions = Vec::new();
            for definition in &set.definitions {
                if !definition.is_enabled_for(&target.name) {
                    continue;
                }
                match definition.check_labels(&target.name, target.label_names()) {
                    Ok(()) => definitions.push(definition.clone()),
                    Err(e) => tracing::error!(error = %e, "Invalid metric definition for target, skipping"),
                }
            }
            per_target.insert(target.name.to_string(), definitions);
        }
        Self { set, per_target }
    }

    pub fn for_target(&self, target: &str) -> &[Arc<MetricDefinition>] {
        self.per_target.get(target).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Everything one target contributed to a tick
struct TargetOutcome {
    target: Arc<Target>,
    up: bool,
    cached: Vec<Arc<Vec<Observation>>>,
    fresh: Vec<(Arc<MetricDefinition>, Result<Vec<Observation>, ScrapeError>)>,
}

pub struct Scraper {
    connections: Arc<ConnectionManager>,
    namespace: String,
    // Outer tick lock; also guards the definition sources
    tick_lock: Mutex<DefinitionStore>,
    plan: ArcSwap<Plan>,
    cache: Mutex<MetricCache>,
    snapshot: ArcSwap<Snapshot>,
    force_reload: AtomicBool,
    metrics: ExporterMetrics,
}

// ============================================================
// Scraper Core Logic
// ============================================================

impl Scraper {
    /// Load the definitions once and prepare an empty snapshot
    pub fn new(connections: Arc<ConnectionManager>, mut store: DefinitionStore, namespace: &str) -> Self {
        let set = store.load();
        tracing::info!(
            definitions = set.len(),
            rejected = set.problems.len(),
            "Metric definitions loaded"
        );
        let plan = Plan::build(set, connections.targets());

        Self {
            connections,
            namespace: namespace.to_string(),
            tick_lock: Mutex::new(store),
            plan: ArcSwap::from_pointee(plan),
            cache: Mutex::new(MetricCache::new()),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            force_reload: AtomicBool::new(false),
            metrics: ExporterMetrics::new(namespace),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn plan(&self) -> Arc<Plan> {
        self.plan.load_full()
    }

    /// Last completed tick
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn metrics(&self) -> &ExporterMetrics {
        &self.metrics
    }

    /// Reload definitions at the start of the next tick even if unchanged
    pub fn request_reload(&self) {
        self.force_reload.store(true, Ordering::SeqCst);
    }

    /// Run one full tick and publish its snapshot.
    ///
    /// A tick in progress blocks the next one. Nothing is published until
    /// every dispatched computation has reported back.
    pub async fn tick(&self) -> Arc<Snapshot> {
        let mut store = self.tick_lock.lock().await;
        let started = Instant::now();

        let force = self.force_reload.swap(false, Ordering::SeqCst);
        if let Some(set) = store.reload_if_changed(force) {
            tracing::info!(
                definitions = set.len(),
                rejected = set.problems.len(),
                "Metric definitions reloaded"
            );
            let plan = Plan::build(set, self.connections.targets());
            let mut cache = self.cache.lock().await;
            self.plan.store(Arc::new(plan));
            cache.reset();
            self.metrics.record_definition_reload();
        }

        let plan = self.plan.load_full();
        let outcomes = futures::future::join_all(
            self.connections
                .targets()
                .iter()
                .map(|target| self.scrape_target(target.clone(), &plan, started)),
        )
        .await;

        let snapshot = self.aggregate(outcomes, started).await;
        self.metrics.record_tick(started.elapsed(), snapshot.errors);
        tracing::debug!(
            observations = snapshot.observations.len(),
            errors = snapshot.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scrape finished"
        );

        let snapshot = Arc::new(snapshot);
        self.snapshot.store(snapshot.clone());
        snapshot
    }

    async fn scrape_target(&self, target: Arc<Target>, plan: &Plan, now: Instant) -> TargetOutcome {
        let mut outcome = TargetOutcome {
            target: target.clone(),
            up: false,
            cached: Vec::new(),
            fresh: Vec::new(),
        };

        match self.connections.health_check(&target).await {
            Health::Healthy => {}
            Health::Down | Health::Invalid => return outcome,
        }
        let session = match self.connections.acquire(&target).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(database = %target.name, error = %e, "Skipping target");
                return outcome;
            }
        };
        outcome.up = true;

        let mut due = Vec::new();
        {
            let cache = self.cache.lock().await;
            for definition in plan.for_target(&target.name) {
                if cache.is_due(&target.name, definition, now) {
                    due.push(definition.clone());
                } else if let Some(record) = cache.cached(&target.name, definition) {
                    outcome.cached.push(record.observations.clone());
                }
            }
        }

        let default_timeout = target.config.query_timeout();
        let mut tasks: FuturesUnordered<_> = due
            .into_iter()
            .map(|definition| {
                let session = session.clone();
                let name = &target.name;
                let labels = &target.labels;
                let namespace = self.namespace.as_str();
                async move {
                    let started = Instant::now();
                    let result = scrape_metric(&**session, &definition, namespace, labels, default_timeout).await;
                    tracing::debug!(
                        database = %name,
                        context = %definition.context,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        ok = result.is_ok(),
                        "Metric computed"
                    );
                    (definition, result)
                }
            })
            .collect();

        while let Some(result) = tasks.next().await {
            outcome.fresh.push(result);
        }

        outcome
    }

    /// Write every fresh result into the cache under one lock and assemble the snapshot
    async fn aggregate(&self, outcomes: Vec<TargetOutcome>, now: Instant) -> Snapshot {
        let up_name = fq_name(&self.namespace, "", "up");
        let mut snapshot = Snapshot::default();
        let mut cache = self.cache.lock().await;

        for outcome in outcomes {
            let target = &outcome.target;
            snapshot.observations.push(Observation::gauge(
                up_name.clone(),
                "Whether the database server is up.",
                target.labels.clone(),
                if outcome.up { 1.0 } else { 0.0 },
            ));

            for cached in &outcome.cached {
                snapshot.observations.extend(cached.iter().cloned());
            }

            for (definition, result) in outcome.fresh {
                match result {
                    Ok(observations) => {
                        snapshot.observations.extend(observations.iter().cloned());
                        cache.record(&target.name, &definition, observations, now);
                    }
                    Err(e) if !e.should_report(definition.ignore_zero_result) => {
                        cache.record(&target.name, &definition, Vec::new(), now);
                    }
                    Err(e) => {
                        snapshot.errors += 1;
                        self.metrics.record_scrape_error(&definition.context);
                        tracing::error!(
                            database = %target.name,
                            context = %definition.context,
                            error = %e,
                            "Error scraping metric"
                        );
                    }
                }
            }
        }

        snapshot.completed_at = Some(Instant::now());
        snapshot
    }

    /// Tick on a fixed schedule until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut ticker = tokio::time::interval(interval);
        // A slow tick delays the next one instead of queueing a burst
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Scrape scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Scrape scheduler stopping");
                    break;
                }
            }
        }
    }
}
