use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use super::AppState;
use crate::observation::render;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Handle /metrics endpoint
///
/// Database observations come from the scraper's snapshot; exporter
/// meta-metrics are appended from the Prometheus recorder.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = if state.on_demand {
        state.scraper.tick().await
    } else {
        state.scraper.snapshot()
    };

    let mut body = render(snapshot.observations.iter());
    body.push_str(&state.handle.render());

    (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}
