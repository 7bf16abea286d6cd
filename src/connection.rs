use crate::config::TargetConfig;
use crate::error::{DbError, ScrapeError};
use crate::session::{with_deadline, Connector, Lease, Row, Session, SessionCell, SessionRef};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ============================================================
// Data Structures
// ============================================================

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ping_timeout: Duration,
    /// How long a target is skipped after its credentials were rejected
    pub invalid_backoff: Duration,
    /// Pause before each warm-up acquisition
    pub warmup_delay: Duration,
    pub warmup_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(5),
            invalid_backoff: Duration::from_secs(300),
            warmup_delay: Duration::from_millis(100),
            warmup_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionSettings {
    pub fn with_backoff(invalid_backoff: Duration) -> Self {
        Self {
            invalid_backoff,
            ..Self::default()
        }
    }
}

/// Outcome of one health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Transient failure; retried next tick
    Down,
    /// Credentials rejected; skipped until the backoff elapses
    Invalid,
}

/// Per-target health flags
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub up: bool,
    pub invalid_until: Option<Instant>,
}

impl HealthState {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        match self.invalid_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    pub fn invalidate_at(&mut self, now: Instant, backoff: Duration) {
        self.up = false;
        self.invalid_until = Some(now + backoff);
    }
}

/// One monitored database instance
pub struct Target {
    pub name: Arc<str>,
    pub config: TargetConfig,
    /// `<database_label>=<name>` followed by the configured constant labels
    pub labels: Vec<(String, String)>,
    session: SessionCell,
    // Held for the whole health check so transitions never interleave
    health: Mutex<HealthState>,
}

impl Target {
    fn new(name: &str, config: TargetConfig, database_label: &str, session: Box<dyn Session>) -> Self {
        let mut labels = vec![(database_label.to_string(), name.to_string())];
        labels.extend(
            config
                .labels
                .iter()
                .filter(|(key, _)| key.as_str() != database_label)
                .map(|(key, value)| (key.clone(), value.clone())),
        );

        Self {
            name: Arc::from(name),
            config,
            labels,
            session: SessionCell::new(session),
            // Not up until a ping or a warm-up succeeds
            health: Mutex::new(HealthState::default()),
        }
    }

    pub async fn health_state(&self) -> HealthState {
        self.health.lock().await.clone()
    }

    pub async fn is_valid(&self) -> bool {
        self.health.lock().await.is_valid_at(Instant::now())
    }

    /// Up and not inside a credential backoff window
    pub async fn is_available(&self) -> bool {
        let state = self.health.lock().await;
        state.up && state.is_valid_at(Instant::now())
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|(key, _)| key.as_str())
    }
}

/// Stand-in for a target whose session could not be built; reports closed so
/// the next health check retries the connector
struct Unavailable(String);

#[async_trait]
impl Session for Unavailable {
    async fn ping(&self) -> Result<(), DbError> {
        Err(DbError::Closed(self.0.clone()))
    }

    async fn fetch_all(&self, _sql: &str) -> Result<Vec<Row>, DbError> {
        Err(DbError::Closed(self.0.clone()))
    }

    async fn lease(&self) -> Result<Lease, DbError> {
        Err(DbError::Closed(self.0.clone()))
    }
}

// ============================================================
// Connection Manager
// ============================================================

pub struct ConnectionManager {
    targets: Vec<Arc<Target>>,
    connector: Arc<dyn Connector>,
    settings: ConnectionSettings,
}

impl ConnectionManager {
    /// Open one session per target. Sessions connect lazily; call
    /// [`ConnectionManager::warm_up_all`] to establish connections up front.
    pub fn new(
        configs: &BTreeMap<String, TargetConfig>,
        database_label: &str,
        connector: Arc<dyn Connector>,
        settings: ConnectionSettings,
    ) -> Self {
        let targets = configs
            .iter()
            .map(|(name, config)| {
                let session = match connector.open(name, config) {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::error!(database = %name, error = %e, "Failed to open session");
                        Box::new(Unavailable(e.to_string())) as Box<dyn Session>
                    }
                };
                Arc::new(Target::new(name, config.clone(), database_label, session))
            })
            .collect();

        Self {
            targets,
            connector,
            settings,
        }
    }

    pub fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Target>> {
        self.targets.iter().find(|t| &*t.name == name)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Warm up every target, one after another
    pub async fn warm_up_all(&self) {
        for target in &self.targets {
            self.warm_up(target).await;
        }
    }

    /// Serially open up to the pool ceiling, then hand every connection back.
    ///
    /// Stops at the first failure and marks the target down.
    pub async fn warm_up(&self, target: &Target) -> bool {
        let wanted = target.config.pool_size();
        let session = target.session.current();
        let mut leases = Vec::with_capacity(wanted as usize);

        for i in 0..wanted {
            tokio::time::sleep(self.settings.warmup_delay).await;
            match with_deadline(self.settings.warmup_timeout, session.lease()).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    tracing::warn!(
                        database = %target.name,
                        opened = i,
                        wanted = wanted,
                        error = %e,
                        "Connection warm-up failed"
                    );
                    let mut state = target.health.lock().await;
                    if e.is_invalid_credentials() {
                        state.invalidate_at(Instant::now(), self.settings.invalid_backoff);
                    } else {
                        state.up = false;
                    }
                    return false;
                }
            }
        }

        tracing::info!(database = %target.name, connections = leases.len(), "Connection pool warmed up");
        drop(leases);
        let mut state = target.health.lock().await;
        if state.is_valid_at(Instant::now()) {
            state.up = true;
        }
        true
    }

    /// Current session of a target, unless it is inside a credential backoff
    pub async fn acquire(&self, target: &Target) -> Result<SessionRef, ScrapeError> {
        if !target.is_valid().await {
            return Err(ScrapeError::TargetUnavailable(target.name.to_string()));
        }
        Ok(target.session.current())
    }

    /// Ping a target and drive its health state machine.
    ///
    /// valid → (credentials rejected) → invalid until T → (T elapsed) → valid
    pub async fn health_check(&self, target: &Target) -> Health {
        let mut state = target.health.lock().await;
        let now = Instant::now();

        if !state.is_valid_at(now) {
            state.up = false;
            return Health::Invalid;
        }

        if state.invalid_until.take().is_some() {
            // Backoff over: rebuild the session so rotated credentials are picked up
            tracing::info!(database = %target.name, "Credential backoff elapsed, reconnecting");
            if let Err(e) = self.reconnect(target) {
                return self.record_failure(target, &mut state, e);
            }
        }

        let session = target.session.current();
        match with_deadline(self.settings.ping_timeout, session.ping()).await {
            Ok(()) => {
                state.up = true;
                Health::Healthy
            }
            Err(e) if e.is_closed() => {
                tracing::warn!(database = %target.name, error = %e, "Session closed, reconnecting");
                if let Err(e) = self.reconnect(target) {
                    return self.record_failure(target, &mut state, e);
                }
                let session = target.session.current();
                match with_deadline(self.settings.ping_timeout, session.ping()).await {
                    Ok(()) => {
                        tracing::info!(database = %target.name, "Reconnected");
                        state.up = true;
                        Health::Healthy
                    }
                    Err(e) => self.record_failure(target, &mut state, e),
                }
            }
            Err(e) => self.record_failure(target, &mut state, e),
        }
    }

    fn record_failure(&self, target: &Target, state: &mut HealthState, error: DbError) -> Health {
        if error.is_invalid_credentials() {
            tracing::error!(
                database = %target.name,
                backoff_secs = self.settings.invalid_backoff.as_secs(),
                error = %error,
                "Invalid credentials, skipping target until backoff elapses"
            );
            state.invalidate_at(Instant::now(), self.settings.invalid_backoff);
            Health::Invalid
        } else {
            tracing::warn!(database = %target.name, error = %error, "Target is down");
            state.up = false;
            Health::Down
        }
    }

    /// Replace the target's session; in-flight holders keep the old one
    fn reconnect(&self, target: &Target) -> Result<(), DbError> {
        let session = self.connector.open(&target.name, &target.config)?;
        target.session.replace(session);
        Ok(())
    }
}
