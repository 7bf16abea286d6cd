//! Log tailing replicator.
//!
//! Mirrors a server-side event stream into a local JSON-lines file. The
//! resume point is never stored separately: it is the timestamp of the last
//! line already in the file, found by scanning backwards from its end.

use crate::config::{LogConfig, SINCE_PLACEHOLDER};
use crate::connection::{ConnectionManager, Health, Target};
use crate::error::TailError;
use crate::metrics::ExporterMetrics;
use crate::session::{with_deadline, Row};
use crate::signals::ShutdownSignal;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Resume record used when the file holds nothing usable
pub const SENTINEL_RECORD: &str =
    r#"{"timestamp":"1900-01-01T01:01:01.001Z","moduleId":"","ecid":"","message":""}"#;

/// Consecutive query failures after which a target is no longer tailed
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// One line of the local log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    #[serde(rename = "moduleId")]
    pub module_id: String,
    pub ecid: String,
    pub message: String,
}

impl LogRecord {
    fn sentinel() -> Self {
        Self {
            timestamp: "1900-01-01T01:01:01.001Z".to_string(),
            module_id: String::new(),
            ecid: String::new(),
            message: String::new(),
        }
    }
}

// ============================================================
// File side
// ============================================================

/// Create the destination (and its directory) if missing
pub fn ensure_file(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(file = %path.display(), "Log destination does not exist, creating it");
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Last non-empty line of the file, read backwards one byte at a time.
///
/// Trailing `\n` and `\r` bytes (blank lines included) are skipped; the scan
/// then stops at the next terminator or at the start of the file.
pub fn read_last_line(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];

    let mut offset = 0u64;
    while offset < size {
        offset += 1;
        file.seek(SeekFrom::End(-(offset as i64)))?;
        file.read_exact(&mut byte)?;
        if byte[0] == b'\n' || byte[0] == b'\r' {
            if bytes.is_empty() {
                continue;
            }
            break;
        }
        bytes.push(byte[0]);
    }

    bytes.reverse();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Resume point recovered from the file's own last record
pub fn read_cursor(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let line = read_last_line(path)?;
    let line = line.trim();
    let record = if line.is_empty() {
        LogRecord::sentinel()
    } else {
        match serde_json::from_str::<LogRecord>(line) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    file = %path.display(),
                    error = %e,
                    "Could not parse last line of log file, replicating from the beginning"
                );
                LogRecord::sentinel()
            }
        }
    };

    Ok(parse_timestamp(&record.timestamp).unwrap_or_else(sentinel_time))
}

/// Append records as JSON lines and flush them to disk
pub fn append_records(path: &Path, records: &[LogRecord]) -> Result<(), TailError> {
    let file_error = |source| TailError::File {
        path: path.display().to_string(),
        source,
    };

    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new().append(true).open(path).map_err(file_error)?;
    file.write_all(&buf).map_err(file_error)?;
    file.sync_data().map_err(file_error)?;
    Ok(())
}

// ============================================================
// Timestamps
// ============================================================

fn sentinel_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 1, 1, 1)
        .single()
        .map(|t| t + chrono::Duration::milliseconds(1))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// ISO-8601 with millisecond precision, always UTC
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accept RFC 3339 and the common `YYYY-MM-DD HH:MM:SS[.f][zone]` database renderings
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f %z"] {
        if let Ok(t) = DateTime::parse_from_str(s, format) {
            return Some(t.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    None
}

fn truncate_to_millis(t: &DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Turn upstream rows into records strictly newer than `since`, oldest first
pub fn records_after(rows: &[Row], since: &DateTime<Utc>) -> Vec<LogRecord> {
    let cursor = truncate_to_millis(since);
    let mut events: Vec<(DateTime<Utc>, LogRecord)> = rows
        .iter()
        .filter_map(|row| {
            let raw = row.text("timestamp");
            let Some(at) = parse_timestamp(raw) else {
                tracing::warn!(timestamp = %raw, "Skipping log event with unreadable timestamp");
                return None;
            };
            let message = row.text("message");
            Some((
                at,
                LogRecord {
                    timestamp: format_timestamp(&at),
                    module_id: row.text("module_id").to_string(),
                    ecid: row.text("ecid").to_string(),
                    message: message.strip_suffix('\n').unwrap_or(message).to_string(),
                },
            ))
        })
        .filter(|(at, _)| truncate_to_millis(at) > cursor)
        .collect();

    events.sort_by_key(|(at, _)| *at);
    events.into_iter().map(|(_, record)| record).collect()
}

// ============================================================
// Replicator
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct TailState {
    pub consecutive_failures: u32,
    pub disabled: bool,
}

pub struct LogTailer {
    connections: Arc<ConnectionManager>,
    config: LogConfig,
    states: DashMap<String, TailState>,
    metrics: ExporterMetrics,
}

impl LogTailer {
    pub fn new(connections: Arc<ConnectionManager>, config: LogConfig, metrics: ExporterMetrics) -> Self {
        Self {
            connections,
            config,
            states: DashMap::new(),
            metrics,
        }
    }

    pub fn destination(&self, target: &str) -> PathBuf {
        self.config.destination_for(target)
    }

    pub fn state(&self, target: &str) -> TailState {
        self.states
            .get(target)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    /// One tailing cycle over every target, concurrently
    pub async fn tail_all(&self) {
        futures::future::join_all(
            self.connections
                .targets()
                .iter()
                .map(|target| self.tail_target(target)),
        )
        .await;
    }

    /// One tailing cycle for one target, with failure accounting.
    ///
    /// The target is pinged first, so tailing works without a scrape loop
    /// keeping health current. Skipped cycles leave the failure count as is.
    ///
    /// Returns the number of appended records, or `None` when the target was
    /// skipped or the cycle failed.
    pub async fn tail_target(&self, target: &Target) -> Option<usize> {
        if self.state(&target.name).disabled {
            return None;
        }
        let health = self.connections.health_check(target).await;
        if health != Health::Healthy {
            tracing::debug!(database = %target.name, health = ?health, "Target unavailable, skipping log tailing");
            return None;
        }

        match self.replicate(target).await {
            Ok(None) => {
                tracing::debug!(database = %target.name, "Target invalidated mid-cycle, skipping log tailing");
                None
            }
            Ok(Some(appended)) => {
                self.states.entry(target.name.to_string()).or_default().consecutive_failures = 0;
                if appended > 0 {
                    self.metrics.record_log_lines(&target.name, appended);
                }
                Some(appended)
            }
            Err(e) if e.is_query_failure() => {
                let mut state = self.states.entry(target.name.to_string()).or_default();
                state.consecutive_failures += 1;
                if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    state.disabled = true;
                    tracing::error!(
                        database = %target.name,
                        failures = state.consecutive_failures,
                        error = %e,
                        "Log tailing disabled for this target"
                    );
                } else {
                    tracing::warn!(
                        database = %target.name,
                        failures = state.consecutive_failures,
                        error = %e,
                        "Log tailing query failed"
                    );
                }
                None
            }
            Err(e) => {
                tracing::error!(database = %target.name, error = %e, "Log tailing failed");
                None
            }
        }
    }

    /// `Ok(None)` when the target became unavailable before the query ran
    async fn replicate(&self, target: &Target) -> Result<Option<usize>, TailError> {
        let path = self.destination(&target.name);

        let since = {
            let read_path = path.clone();
            tokio::task::spawn_blocking(move || {
                ensure_file(&read_path)?;
                read_cursor(&read_path)
            })
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            .and_then(|r| r)
            .map_err(|source| TailError::File {
                path: path.display().to_string(),
                source,
            })?
        };

        let Ok(session) = self.connections.acquire(target).await else {
            return Ok(None);
        };

        let sql = self
            .config
            .query
            .replace(SINCE_PLACEHOLDER, &format_timestamp(&since));
        let rows = with_deadline(target.config.query_timeout(), session.fetch_all(&sql))
            .await
            .map_err(TailError::Query)?;

        let records = records_after(&rows, &since);
        if records.is_empty() {
            return Ok(Some(0));
        }

        let count = records.len();
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || append_records(&write_path, &records))
            .await
            .map_err(|e| TailError::File {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })??;

        tracing::debug!(database = %target.name, appended = count, "Log records appended");
        Ok(Some(count))
    }

    /// Tail on a fixed schedule until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.config.interval().as_secs(), "Log tailer started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tail_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Log tailer stopping");
                    break;
                }
            }
        }
    }
}
