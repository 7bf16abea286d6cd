use axum::{extract::State, http::StatusCode, response::Html, Json};
use serde_json::{json, Value};

use super::AppState;

/// Liveness plus the health flags of every target
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut targets = Vec::new();
    for target in state.scraper.connections().targets() {
        let health = target.health_state().await;
        let valid = target.is_valid().await;
        targets.push(json!({
            "name": &*target.name,
            "up": health.up,
            "credentials_valid": valid,
        }));
    }

    let plan = state.scraper.plan();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "definitions": plan.set.len(),
            "rejected_definitions": plan.set.problems.len(),
            "targets": targets,
        })),
    )
}

/// Landing page
pub async fn index(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html><head><title>dbmon</title></head><body>\
         <h1>dbmon</h1><p><a href=\"{0}\">Metrics</a></p></body></html>",
        state.metrics_path
    ))
}
