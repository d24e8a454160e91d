use axum::{extract::State, Json};
use serde_json::{json, Value};
use sitewarden_scheduler::PauseFlag;
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /health — liveness probe, returns server metadata and runner state.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let paused = state.settings.is_paused().unwrap_or_else(|e| {
        warn!(error = %e, "health: cannot read pause flag");
        false
    });
    let last_run = state.settings.last_heartbeat().ok().flatten();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("SITEWARDEN_GIT_SHA"),
        "paused": paused,
        "last_run": last_run,
    }))
}
