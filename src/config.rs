use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the target name in the log destination
pub const TARGET_PLACEHOLDER: &str = "{target}";
/// Placeholder substituted with the resume timestamp in the log query
pub const SINCE_PLACEHOLDER: &str = "{since}";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_path: default_metrics_path(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name of the constant label carrying the target name
    #[serde(default = "default_database_label")]
    pub database_label: String,
    /// Built-in definitions file
    pub default: Option<PathBuf>,
    #[serde(default)]
    pub custom: Vec<PathBuf>,
    /// 0 means scrape on every `/metrics` request
    #[serde(default)]
    pub scrape_interval_seconds: u64,
    #[serde(default = "default_connection_backoff")]
    pub connection_backoff_seconds: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            database_label: default_database_label(),
            default: None,
            custom: Vec::new(),
            scrape_interval_seconds: 0,
            connection_backoff_seconds: default_connection_backoff(),
        }
    }
}

impl MetricsConfig {
    pub fn scrape_interval(&self) -> Option<Duration> {
        (self.scrape_interval_seconds > 0).then(|| Duration::from_secs(self.scrape_interval_seconds))
    }

    pub fn connection_backoff(&self) -> Duration {
        Duration::from_secs(self.connection_backoff_seconds)
    }

    /// Every definitions file, default first
    pub fn definition_sources(&self) -> Vec<PathBuf> {
        self.default
            .iter()
            .chain(self.custom.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_log_destination")]
    pub destination: String,
    #[serde(default)]
    pub query: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_log_interval(),
            destination: default_log_destination(),
            query: String::new(),
        }
    }
}

impl LogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    /// Destination file for one target
    pub fn destination_for(&self, target: &str) -> PathBuf {
        PathBuf::from(self.destination.replace(TARGET_PLACEHOLDER, target))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub password_env: Option<String>,
    pub username_env: Option<String>,
    /// Administrative role, e.g. SYSDBA
    pub role: Option<String>,
    #[serde(default = "default_max_open_conns")]
    pub max_open_conns: u32,
    #[serde(default)]
    pub pool_min_connections: u32,
    pub pool_max_connections: Option<u32>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
    /// Constant labels added to every observation of this target
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Hard ceiling on pool size and warm-up connections
pub const MAX_POOL_SIZE: u32 = 100;

impl TargetConfig {
    /// Pool ceiling: `max_open_conns` when set, else `pool_max_connections`, capped
    pub fn pool_size(&self) -> u32 {
        let size = if self.max_open_conns >= 1 {
            self.max_open_conns
        } else {
            self.pool_max_connections.unwrap_or(1)
        };
        size.clamp(1, MAX_POOL_SIZE)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds.max(1))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9161
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_namespace() -> String {
    "dbmon".to_string()
}

fn default_database_label() -> String {
    "database".to_string()
}

fn default_connection_backoff() -> u64 {
    300
}

fn default_log_interval() -> u64 {
    15
}

fn default_log_destination() -> String {
    "/log/alert.log".to_string()
}

fn default_max_open_conns() -> u32 {
    10
}

fn default_query_timeout() -> u64 {
    5
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("DBMON").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.targets.is_empty() {
        anyhow::bail!("At least one target must be configured");
    }

    for (name, target) in &cfg.targets {
        if name.is_empty() {
            anyhow::bail!("Target name cannot be empty");
        }
        if target.url.trim().is_empty() {
            anyhow::bail!("Target '{}' has an empty url", name);
        }
    }

    if !cfg.server.metrics_path.starts_with('/') {
        anyhow::bail!("metrics_path must start with '/': {}", cfg.server.metrics_path);
    }
    if matches!(cfg.server.metrics_path.as_str(), "/" | "/health") {
        anyhow::bail!("metrics_path '{}' collides with a built-in route", cfg.server.metrics_path);
    }

    if cfg.metrics.namespace.is_empty() {
        anyhow::bail!("Metrics namespace cannot be empty");
    }

    if cfg.log.enabled {
        if cfg.log.query.trim().is_empty() {
            anyhow::bail!("Log tailing is enabled but log.query is empty");
        }
        if cfg.targets.len() > 1 && !cfg.log.destination.contains(TARGET_PLACEHOLDER) {
            anyhow::bail!(
                "log.destination must contain '{}' when several targets are tailed",
                TARGET_PLACEHOLDER
            );
        }
    }

    // Same instance configured twice is allowed, but almost always a mistake
    let mut seen = HashSet::new();
    for (name, target) in &cfg.targets {
        let key = (target.url.as_str(), target.username.as_deref().unwrap_or(""));
        if !seen.insert(key) {
            tracing::warn!(database = %name, "Duplicate target url/username pair");
        }
    }

    Ok(())
}
