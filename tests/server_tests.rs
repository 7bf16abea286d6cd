/// Integration tests for the HTTP surface
mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use common::{invalid_credentials, manager, target_config, write_definitions, FakeConnector, FakeDatabase};
use dbmon::definition::DefinitionStore;
use dbmon::handlers::AppState;
use dbmon::scheduler::Scraper;
use dbmon::server::create_router;
use dbmon::session::Row;
use metrics_exporter_prometheus::PrometheusBuilder;
use prometheus_parse::{Scrape, Value};
use std::sync::Arc;
use tower::ServiceExt;

const DEFINITIONS: &str = r#"
[[metric]]
context = "sessions"
labels = ["status"]
metricsdesc = { value = "Gauge metric with count of sessions by status." }
request = "SELECT status, COUNT(*) AS value FROM v$session GROUP BY status"

[[metric]]
context = "query"
metricsdesc = { latency = "Query latency in milliseconds." }
metricstype = { latency = "histogram" }
metricsbuckets = { latency = { le_10 = "10", le_100 = "100" } }
request = "SELECT count, latency, le_10, le_100 FROM latency_histogram"
"#;

struct Fixture {
    app: Router,
    scraper: Arc<Scraper>,
    _dir: tempfile::TempDir,
}

fn fixture(on_demand: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let defs = write_definitions(dir.path(), "default-metrics.toml", DEFINITIONS);

    let a = FakeDatabase::new();
    a.respond(
        "v$session",
        vec![Row::new().with("status", "ACTIVE").with("value", "12")],
    );
    a.respond(
        "latency_histogram",
        vec![Row::new()
            .with("count", "6")
            .with("latency", "250.5")
            .with("le_10", "3")
            .with("le_100", "5")],
    );
    let b = FakeDatabase::new();
    b.fail_pings(invalid_credentials());

    let connections = manager(
        FakeConnector::default().with("a", a).with("b", b),
        &[("a", target_config(&[("env", "prod")])), ("b", target_config(&[]))],
    );
    let scraper = Arc::new(Scraper::new(connections, DefinitionStore::new(vec![defs]), "dbmon"));

    let recorder = PrometheusBuilder::new().build_recorder();
    let state = AppState {
        scraper: scraper.clone(),
        handle: Arc::new(recorder.handle()),
        on_demand,
        metrics_path: "/metrics".to_string(),
    };

    Fixture {
        app: create_router(state),
        scraper,
        _dir: dir,
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

fn parse(body: &str) -> Scrape {
    let lines: Vec<_> = body.lines().map(|s| Ok(s.to_owned())).collect();
    Scrape::parse(lines.into_iter()).unwrap()
}

fn gauge(scrape: &Scrape, metric: &str, database: &str) -> Option<f64> {
    scrape
        .samples
        .iter()
        .find(|s| s.metric == metric && s.labels.get("database") == Some(database))
        .and_then(|s| match s.value {
            Value::Gauge(v) | Value::Untyped(v) => Some(v),
            _ => None,
        })
}

#[tokio::test]
async fn test_metrics_endpoint_scrapes_on_demand() {
    let fixture = fixture(true);
    let (status, content_type, body) = get(fixture.app, "/metrics").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain; version=0.0.4"));

    let scrape = parse(&body);
    assert_eq!(gauge(&scrape, "dbmon_up", "a"), Some(1.0));
    assert_eq!(gauge(&scrape, "dbmon_up", "b"), Some(0.0));
    assert_eq!(gauge(&scrape, "dbmon_sessions_value", "a"), Some(12.0));
    assert_eq!(gauge(&scrape, "dbmon_sessions_value", "b"), None);

    let up = scrape
        .samples
        .iter()
        .find(|s| s.metric == "dbmon_up" && s.labels.get("database") == Some("a"))
        .unwrap();
    assert_eq!(up.labels.get("env"), Some("prod"));

    let sessions = scrape
        .samples
        .iter()
        .find(|s| s.metric == "dbmon_sessions_value")
        .unwrap();
    assert_eq!(sessions.labels.get("env"), Some("prod"));
    assert_eq!(sessions.labels.get("status"), Some("ACTIVE"));

    let histogram = scrape
        .samples
        .iter()
        .find(|s| s.metric == "dbmon_query_latency")
        .unwrap();
    match &histogram.value {
        Value::Histogram(buckets) => {
            let counts: Vec<(f64, f64)> = buckets.iter().map(|b| (b.less_than, b.count)).collect();
            assert_eq!(counts, vec![(10.0, 3.0), (100.0, 5.0), (f64::INFINITY, 6.0)]);
        }
        other => panic!("expected a histogram, got {:?}", other),
    }
    assert!(body.contains("dbmon_query_latency_sum{database=\"a\",env=\"prod\"} 250.5"));
    assert!(body.contains("dbmon_query_latency_count{database=\"a\",env=\"prod\"} 6"));
}

#[tokio::test]
async fn test_metrics_endpoint_serves_last_snapshot() {
    let fixture = fixture(false);

    // Nothing scraped yet
    let (status, _, body) = get(fixture.app.clone(), "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains("dbmon_up"));

    fixture.scraper.tick().await;
    let (_, _, body) = get(fixture.app, "/metrics").await;
    let scrape = parse(&body);
    assert_eq!(gauge(&scrape, "dbmon_up", "a"), Some(1.0));
}

#[tokio::test]
async fn test_health_endpoint_reports_targets() {
    let fixture = fixture(false);
    fixture.scraper.tick().await;

    let (status, _, body) = get(fixture.app, "/health").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["definitions"], 2);
    assert_eq!(json["rejected_definitions"], 0);

    let targets = json["targets"].as_array().unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0]["name"], "a");
    assert_eq!(targets[0]["up"], true);
    assert_eq!(targets[1]["name"], "b");
    assert_eq!(targets[1]["up"], false);
    assert_eq!(targets[1]["credentials_valid"], false);
}

#[tokio::test]
async fn test_index_links_metrics_path() {
    let fixture = fixture(false);
    let (status, _, body) = get(fixture.app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("href=\"/metrics\""));
}
