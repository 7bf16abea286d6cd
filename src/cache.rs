use crate::definition::MetricDefinition;
use crate::observation::Observation;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Last successful computation of one definition for one target
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub observations: Arc<Vec<Observation>>,
    pub computed_at: Instant,
}

/// Target × definition table of last-computed observations
#[derive(Debug, Default)]
pub struct MetricCache {
    records: HashMap<(String, String), CacheRecord>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the definition must be recomputed for this target now.
    ///
    /// Without an interval it is always due; otherwise it is due when it was
    /// never computed or strictly more than the interval has passed.
    pub fn is_due(&self, target: &str, definition: &MetricDefinition, now: Instant) -> bool {
        let Some(interval) = definition.scrape_interval else {
            return true;
        };
        match self.records.get(&key(target, definition)) {
            None => true,
            Some(record) => now.saturating_duration_since(record.computed_at) > interval,
        }
    }

    pub fn record(
        &mut self,
        target: &str,
        definition: &MetricDefinition,
        observations: Vec<Observation>,
        now: Instant,
    ) {
        self.records.insert(
            key(target, definition),
            CacheRecord {
                observations: Arc::new(observations),
                computed_at: now,
            },
        );
    }

    pub fn cached(&self, target: &str, definition: &MetricDefinition) -> Option<&CacheRecord> {
        self.records.get(&key(target, definition))
    }

    /// Drop every record; used when the definition set is replaced
    pub fn reset(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn key(target: &str, definition: &MetricDefinition) -> (String, String) {
    (target.to_string(), definition.id.clone())
}
