use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns server metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let jobs = state.scheduler.list().map(|jobs| jobs.len()).ok();
    Json(json!({
        "status": if jobs.is_some() { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CADENCE_GIT_SHA"),
        "jobs": jobs,
    }))
}
