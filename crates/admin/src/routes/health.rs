use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/health
///
/// Returns the service status, uptime and the active storage backend.
pub async fn health_check(State(state): State<SharedState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let storage = state.limiter.storage();

    Json(json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "storage": storage.kind().as_str(),
        "store_fallbacks": storage.fallback_count()
    }))
}
