//! Resolved metric observations and their Prometheus text exposition.

use crate::definition::MetricKind;
use prometheus::proto::{Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    /// Total number of observations
    pub count: u64,
    /// (upper bound, cumulative count), ascending by bound
    pub buckets: Vec<(f64, u64)>,
}

/// A fully resolved value ready for publication
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Fully-qualified metric name
    pub name: String,
    pub help: String,
    /// Constant target labels followed by per-metric labels
    pub labels: Vec<(String, String)>,
    pub kind: MetricKind,
    /// Sample value; the sum for histograms
    pub value: f64,
    pub histogram: Option<HistogramData>,
}

impl Observation {
    pub fn gauge(name: impl Into<String>, help: impl Into<String>, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            labels,
            kind: MetricKind::Gauge,
            value,
            histogram: None,
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Metric name from namespace, subsystem and name, skipping empty parts
pub fn fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Encode observations in the Prometheus text format.
///
/// Samples sharing a name are grouped into one family, in order of first
/// appearance; the family takes its help text and type from the first sample.
pub fn render<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> String {
    let families = metric_families(observations);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metric families");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Group observations into protobuf metric families
pub fn metric_families<'a>(observations: impl IntoIterator<Item = &'a Observation>) -> Vec<MetricFamily> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut families: Vec<MetricFamily> = Vec::new();

    for obs in observations {
        let slot = *index.entry(obs.name.as_str()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(obs.name.clone());
            family.set_help(obs.help.clone());
            family.set_field_type(metric_type(obs.kind));
            families.push(family);
            families.len() - 1
        });
        let family = &mut families[slot];
        let kind = family.get_field_type();
        family.mut_metric().push(to_metric(obs, kind));
    }
    families
}

fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Gauge => MetricType::GAUGE,
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Histogram => MetricType::HISTOGRAM,
    }
}

fn to_metric(obs: &Observation, kind: MetricType) -> Metric {
    let mut metric = Metric::default();
    for (name, value) in &obs.labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    match kind {
        MetricType::COUNTER => {
            let mut counter = Counter::default();
            counter.set_value(obs.value);
            metric.set_counter(counter);
        }
        MetricType::HISTOGRAM => {
            let mut histogram = Histogram::default();
            histogram.set_sample_sum(obs.value);
            if let Some(data) = &obs.histogram {
                histogram.set_sample_count(data.count);
                for (bound, count) in &data.buckets {
                    let mut bucket = Bucket::default();
                    bucket.set_upper_bound(*bound);
                    bucket.set_cumulative_count(*count);
                    histogram.mut_bucket().push(bucket);
                }
            }
            metric.set_histogram(histogram);
        }
        _ => {
            let mut gauge = Gauge::default();
            gauge.set_value(obs.value);
            metric.set_gauge(gauge);
        }
    }
    metric
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_fq_name() {
        assert_eq!(fq_name("dbmon", "sessions", "value"), "dbmon_sessions_value");
        assert_eq!(fq_name("dbmon", "", "up"), "dbmon_up");
    }

    #[test]
    fn test_render_gauge_family() {
        let a = Observation::gauge("dbmon_sessions_value", "Sessions", labels(&[("database", "a"), ("status", "ACTIVE")]), 3.0);
        let b = Observation::gauge("dbmon_sessions_value", "Sessions", labels(&[("database", "a"), ("status", "IDLE")]), 0.5);
        let text = render([&a, &b]);
        assert_eq!(
            text,
            "# HELP dbmon_sessions_value Sessions\n\
             # TYPE dbmon_sessions_value gauge\n\
             dbmon_sessions_value{database=\"a\",status=\"ACTIVE\"} 3\n\
             dbmon_sessions_value{database=\"a\",status=\"IDLE\"} 0.5\n"
        );
    }

    #[test]
    fn test_render_histogram() {
        let obs = Observation {
            name: "dbmon_io_latency".to_string(),
            help: "IO latency".to_string(),
            labels: labels(&[("database", "a")]),
            kind: MetricKind::Histogram,
            value: 42.5,
            histogram: Some(HistogramData {
                count: 10,
                buckets: vec![(1.0, 4), (10.0, 9)],
            }),
        };
        let text = render([&obs]);
        assert!(text.contains("# TYPE dbmon_io_latency histogram\n"));
        assert!(text.contains("dbmon_io_latency_bucket{database=\"a\",le=\"1\"} 4\n"));
        assert!(text.contains("dbmon_io_latency_bucket{database=\"a\",le=\"10\"} 9\n"));
        assert!(text.contains("dbmon_io_latency_bucket{database=\"a\",le=\"+Inf\"} 10\n"));
        assert!(text.contains("dbmon_io_latency_sum{database=\"a\"} 42.5\n"));
        assert!(text.contains("dbmon_io_latency_count{database=\"a\"} 10\n"));
    }

    #[test]
    fn test_label_escaping() {
        let obs = Observation::gauge("m", "line\nbreak", labels(&[("q", "say \"hi\"\\")]), 1.0);
        let text = render([&obs]);
        assert!(text.contains("# HELP m line\\nbreak\n"));
        assert!(text.contains("m{q=\"say \\\"hi\\\"\\\\\"} 1\n"));
    }

    #[test]
    fn test_render_unlabelled() {
        let obs = Observation::gauge("dbmon_up", "Up", Vec::new(), f64::NAN);
        assert!(render([&obs]).ends_with("dbmon_up NaN\n"));
    }

    #[test]
    fn test_families_keep_first_appearance_order() {
        let up = Observation::gauge("dbmon_up", "Up", labels(&[("database", "a")]), 1.0);
        let mut commits = Observation::gauge("dbmon_activity_value", "Commits", labels(&[("database", "a")]), 7.0);
        commits.kind = MetricKind::Counter;
        let up_b = Observation::gauge("dbmon_up", "Up", labels(&[("database", "b")]), 0.0);

        let families = metric_families([&up, &commits, &up_b]);
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].get_name(), "dbmon_up");
        assert_eq!(families[0].get_metric().len(), 2);
        assert_eq!(families[1].get_field_type(), MetricType::COUNTER);
        assert_eq!(families[1].get_metric()[0].get_counter().get_value(), 7.0);

        let text = render([&up, &commits, &up_b]);
        assert!(text.contains("# TYPE dbmon_activity_value counter\n"));
        assert!(text.find("dbmon_up{database=\"b\"} 0").unwrap() < text.find("# HELP dbmon_activity_value").unwrap());
    }

    #[test]
    fn test_render_nothing() {
        assert_eq!(render(std::iter::empty::<&Observation>()), "");
    }
}
