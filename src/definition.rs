//! Metric definitions: TOML model, validation, and hash-tracked reload.

use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ============================================================
// File format
// ============================================================

/// One definitions file: a list of `[[metric]]` tables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub metric: Vec<RawDefinition>,
}

/// A metric definition exactly as written in the file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawDefinition {
    pub context: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Output column → help text
    #[serde(default)]
    pub metricsdesc: BTreeMap<String, String>,
    /// Output column → gauge | counter | histogram
    #[serde(default)]
    pub metricstype: BTreeMap<String, String>,
    /// Histogram column → (bucket column → upper bound)
    #[serde(default)]
    pub metricsbuckets: BTreeMap<String, BTreeMap<String, String>>,
    pub fieldtoappend: Option<String>,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub ignorezeroresult: bool,
    pub querytimeout: Option<String>,
    pub scrapeinterval: Option<String>,
    /// Absent: every target. Empty: no target.
    pub databases: Option<Vec<String>>,
}

// ============================================================
// Validated definitions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
    Histogram,
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            "histogram" => Ok(Self::Histogram),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricColumn {
    /// Lower-cased column name
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// Bucket column → upper bound, ascending by bound
    pub buckets: Vec<(String, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    /// Unique within one loaded set
    pub id: String,
    pub context: String,
    /// Label columns in declared order, without `field_to_append`
    pub labels: Vec<String>,
    pub columns: Vec<MetricColumn>,
    pub field_to_append: Option<String>,
    pub request: String,
    pub ignore_zero_result: bool,
    pub query_timeout: Option<Duration>,
    pub scrape_interval: Option<Duration>,
    pub databases: Option<Vec<String>>,
}

impl MetricDefinition {
    pub fn from_raw(raw: &RawDefinition) -> Result<Self, DefinitionError> {
        let context = raw.context.trim().to_string();

        if raw.request.trim().is_empty() {
            return Err(DefinitionError::MissingRequest { context });
        }
        if raw.metricsdesc.is_empty() {
            return Err(DefinitionError::MissingColumns { context });
        }

        let types: HashMap<String, &String> = raw
            .metricstype
            .iter()
            .map(|(column, kind)| (column.to_lowercase(), kind))
            .collect();
        let buckets: HashMap<String, &BTreeMap<String, String>> = raw
            .metricsbuckets
            .iter()
            .map(|(column, map)| (column.to_lowercase(), map))
            .collect();

        let mut columns = Vec::with_capacity(raw.metricsdesc.len());
        for (column, help) in &raw.metricsdesc {
            let name = column.to_lowercase();
            let kind = match types.get(&name) {
                Some(kind) => kind.parse::<MetricKind>().map_err(|kind| {
                    DefinitionError::UnknownType {
                        context: context.clone(),
                        column: name.clone(),
                        kind,
                    }
                })?,
                None => MetricKind::Gauge,
            };

            let column_buckets = if kind == MetricKind::Histogram {
                let map = buckets.get(&name).ok_or_else(|| DefinitionError::MissingBuckets {
                    context: context.clone(),
                    column: name.clone(),
                })?;
                parse_buckets(&context, &name, map)
            } else {
                Vec::new()
            };

            columns.push(MetricColumn {
                name,
                help: help.clone(),
                kind,
                buckets: column_buckets,
            });
        }

        let field_to_append = raw
            .fieldtoappend
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_lowercase);

        let labels = raw
            .labels
            .iter()
            .map(|label| label.to_lowercase())
            .filter(|label| Some(label) != field_to_append.as_ref())
            .collect();

        Ok(Self {
            id: context.clone(),
            labels,
            columns,
            field_to_append,
            request: raw.request.clone(),
            ignore_zero_result: raw.ignorezeroresult,
            query_timeout: parse_duration(&context, "querytimeout", raw.querytimeout.as_deref())?,
            scrape_interval: parse_duration(&context, "scrapeinterval", raw.scrapeinterval.as_deref())?,
            databases: raw.databases.clone(),
            context,
        })
    }

    pub fn is_enabled_for(&self, target: &str) -> bool {
        match &self.databases {
            None => true,
            Some(list) => list.iter().any(|name| name == target),
        }
    }

    /// Reject labels that repeat each other or a constant label of the target
    pub fn check_labels<'a>(
        &self,
        target: &str,
        constant_labels: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), DefinitionError> {
        let mut seen: HashSet<&str> = constant_labels.into_iter().collect();
        for label in &self.labels {
            if !seen.insert(label.as_str()) {
                return Err(DefinitionError::DuplicateLabel {
                    context: self.context.clone(),
                    label: label.clone(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn parse_buckets(context: &str, column: &str, map: &BTreeMap<String, String>) -> Vec<(String, f64)> {
    let mut buckets: Vec<(String, f64)> = map
        .iter()
        .filter_map(|(bucket_column, le)| match le.trim().parse::<f64>() {
            Ok(bound) => Some((bucket_column.to_lowercase(), bound)),
            Err(_) => {
                tracing::error!(
                    context = %context,
                    metric = %column,
                    bucket = %bucket_column,
                    le = %le,
                    "Unable to convert bucket limit to float, dropping bucket"
                );
                None
            }
        })
        .collect();
    buckets.sort_by(|a, b| a.1.total_cmp(&b.1));
    buckets
}

/// Humantime duration; a bare number means seconds
fn parse_duration(
    context: &str,
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<Duration>, DefinitionError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    let parsed = match value.parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(value).map_err(|e| e.to_string()),
    };

    match parsed {
        Ok(d) if d.is_zero() => Ok(None),
        Ok(d) => Ok(Some(d)),
        Err(reason) => Err(DefinitionError::InvalidDuration {
            context: context.to_string(),
            field,
            value: value.to_string(),
            reason,
        }),
    }
}

/// Lower-cased, spaces to `_`, parentheses, slashes and asterisks removed
pub fn clean_name(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '(' | ')' | '/' | '*'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

// ============================================================
// Loading
// ============================================================

/// Result of one (re)load: every valid definition and a message per rejected one
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    pub definitions: Vec<Arc<MetricDefinition>>,
    pub problems: Vec<String>,
}

impl DefinitionSet {
    pub fn from_raw(raw: impl IntoIterator<Item = RawDefinition>) -> Self {
        let mut set = Self::default();
        set.extend(raw);
        set
    }

    fn extend(&mut self, raw: impl IntoIterator<Item = RawDefinition>) {
        let mut ids: HashSet<String> = self.definitions.iter().map(|d| d.id.clone()).collect();
        for raw in raw {
            match MetricDefinition::from_raw(&raw) {
                Ok(mut definition) => {
                    definition.id = unique_id(&definition, &mut ids);
                    self.definitions.push(Arc::new(definition));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Invalid metric definition, skipping");
                    self.problems.push(e.to_string());
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn unique_id(definition: &MetricDefinition, ids: &mut HashSet<String>) -> String {
    let columns: Vec<&str> = definition.columns.iter().map(|c| c.name.as_str()).collect();
    let base = format!("{}[{}]", definition.context, columns.join(","));
    let mut id = base.clone();
    let mut n = 1;
    while !ids.insert(id.clone()) {
        n += 1;
        id = format!("{}#{}", base, n);
    }
    id
}

/// Owns the definition sources and the content hash of each
pub struct DefinitionStore {
    sources: Vec<PathBuf>,
    hashes: HashMap<PathBuf, [u8; 32]>,
}

impl DefinitionStore {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            hashes: HashMap::new(),
        }
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Compare every source against its recorded hash and record the new ones.
    ///
    /// Unreadable sources are reported and count as unchanged.
    pub fn check_for_changes(&mut self) -> bool {
        let mut changed = false;
        for path in &self.sources {
            match hash_file(path) {
                Ok(hash) => {
                    if self.hashes.get(path) != Some(&hash) {
                        tracing::info!(file = %path.display(), "Metric definitions changed");
                        self.hashes.insert(path.clone(), hash);
                        changed = true;
                    }
                }
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "Unable to hash definitions file");
                }
            }
        }
        changed
    }

    /// Parse every source; a broken file is skipped, not the whole set
    pub fn load(&mut self) -> DefinitionSet {
        let mut set = DefinitionSet::default();
        for path in &self.sources {
            match read_definition_file(path) {
                Ok((file, hash)) => {
                    self.hashes.insert(path.clone(), hash);
                    let before = set.len();
                    set.extend(file.metric);
                    tracing::info!(
                        file = %path.display(),
                        loaded = set.len() - before,
                        "Loaded metric definitions"
                    );
                }
                Err(message) => {
                    tracing::error!(file = %path.display(), error = %message, "Failed to load definitions file");
                    set.problems.push(format!("{}: {}", path.display(), message));
                }
            }
        }
        set
    }

    /// Reload when forced or when any source changed since the last check
    pub fn reload_if_changed(&mut self, force: bool) -> Option<DefinitionSet> {
        let changed = self.check_for_changes();
        (changed || force).then(|| self.load())
    }
}

fn hash_file(path: &Path) -> std::io::Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    Ok(Sha256::digest(&bytes).into())
}

fn read_definition_file(path: &Path) -> Result<(DefinitionFile, [u8; 32]), String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let hash: [u8; 32] = Sha256::digest(&bytes).into();
    let text = std::str::from_utf8(&bytes).map_err(|e| e.to_string())?;
    let file: DefinitionFile = toml::from_str(text).map_err(|e| e.to_string())?;
    Ok((file, hash))
}
