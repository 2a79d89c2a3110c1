use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// DELETE /api/quota
///
/// Clears every identifier's quota counters. Activity history is kept.
pub async fn reset_all(State(state): State<SharedState>) -> Json<Value> {
    let removed = state.limiter.reset(None).await;
    state.metrics.quota_resets_total.inc();
    tracing::info!(removed, "all quotas reset via admin API");

    Json(json!({
        "status": "reset",
        "removed": removed
    }))
}

/// DELETE /api/quota/{ip}
///
/// Clears one identifier's quota counters.
pub async fn reset_one(State(state): State<SharedState>, Path(ip): Path<String>) -> Json<Value> {
    let removed = state.limiter.reset(Some(&ip)).await;
    state.metrics.quota_resets_total.inc();
    tracing::info!(ip = %ip, removed, "quota reset via admin API");

    Json(json!({
        "status": "reset",
        "ip": ip,
        "removed": removed
    }))
}
