use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use quotaguard_rate_limit::analytics::summarize;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::SharedState;

/// Query parameters for the log tail endpoint.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Maximum number of entries to return (default: 100).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /api/analytics
///
/// Every identifier's aggregate, busiest first, with overall totals.
pub async fn list_analytics(State(state): State<SharedState>) -> Json<Value> {
    let all = state.analytics.get_all().await;
    let count = all.len();
    let summary = summarize(all.clone());

    Json(json!({
        "success": true,
        "analytics": all,
        "count": count,
        "summary": summary
    }))
}

/// GET /api/analytics/{ip}
pub async fn get_analytics(
    State(state): State<SharedState>,
    Path(ip): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.analytics.get_one(&ip).await {
        Some(analytics) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "analytics": analytics
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("no data found for {}", ip)
            })),
        ),
    }
}

/// GET /api/analytics/{ip}/logs
///
/// Most recent log entries for one identifier, newest first.
pub async fn get_logs(
    State(state): State<SharedState>,
    Path(ip): Path<String>,
    Query(params): Query<LogQuery>,
) -> Json<Value> {
    let limit = params.limit.min(state.limiter.activity().log_depth());
    let logs = state.analytics.get_log(&ip, limit).await;

    Json(json!({
        "success": true,
        "ip": ip,
        "count": logs.len(),
        "logs": logs
    }))
}
