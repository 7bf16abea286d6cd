/// The shipped sample configuration and definitions must stay loadable
use dbmon::config::load_config;
use dbmon::definition::{DefinitionStore, MetricKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn shipped(file: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(file)
}

#[test]
fn test_example_config_loads() {
    let cfg = load_config(&shipped("dbmon.example.toml")).unwrap();

    assert_eq!(cfg.server.port, 9161);
    assert_eq!(cfg.metrics.scrape_interval(), Some(Duration::from_secs(30)));
    assert_eq!(cfg.targets.len(), 2);

    let primary = &cfg.targets["primary"];
    assert_eq!(primary.pool_size(), 4);
    assert_eq!(primary.labels["region"], "eu-west-1");
    assert!(!cfg.log.enabled);
    assert!(cfg.log.query.contains("{since}"));
}

#[test]
fn test_default_definitions_are_valid() {
    let mut store = DefinitionStore::new(vec![shipped("default-metrics.toml")]);
    let set = store.load();

    assert!(set.problems.is_empty(), "{:?}", set.problems);
    assert_eq!(set.len(), 7);

    let latency = set
        .definitions
        .iter()
        .find(|d| d.context == "statement_latency")
        .unwrap();
    assert_eq!(latency.columns[0].kind, MetricKind::Histogram);
    let bounds: Vec<f64> = latency.columns[0].buckets.iter().map(|(_, le)| *le).collect();
    assert_eq!(bounds, vec![0.1, 1.0, 10.0]);
    assert_eq!(latency.scrape_interval, Some(Duration::from_secs(60)));

    let size = set.definitions.iter().find(|d| d.context == "database_size").unwrap();
    assert_eq!(size.query_timeout, Some(Duration::from_secs(30)));
    assert!(size.is_enabled_for("primary"));
    assert!(!size.is_enabled_for("reporting"));
}
