use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::Json;
use quotaguard_common::WindowName;
use quotaguard_rate_limit::RateLimitDecision;
use serde::{Deserialize, Serialize};

use super::client::{client_identifier, user_agent};
use crate::state::SharedState;

/// Query parameters for the usage endpoint.
#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    /// Evaluate for this identifier instead of the caller's address.
    pub ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageResponse {
    pub success: bool,
    pub identifier: String,
    #[serde(flatten)]
    pub decision: RateLimitDecision,
    pub retry_after_secs: u64,
    pub limits: BTreeMap<WindowName, u64>,
}

fn usage_response(
    state: &SharedState,
    success: bool,
    identifier: String,
    decision: RateLimitDecision,
) -> UsageResponse {
    let retry_after_secs = decision.retry_after_secs(state.limiter.now_millis());
    UsageResponse {
        success,
        identifier,
        decision,
        retry_after_secs,
        limits: state
            .limiter
            .windows()
            .iter()
            .map(|w| (w.name, w.ceiling))
            .collect(),
    }
}

fn rate_limit_headers(decision: &RateLimitDecision, retry_after_secs: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(decision.reset_at),
    );
    if let Some(window) = decision.violated_window {
        headers.insert(
            HeaderName::from_static("x-ratelimit-window"),
            HeaderValue::from_static(window.as_str()),
        );
        headers.insert(
            axum::http::header::RETRY_AFTER,
            HeaderValue::from(retry_after_secs),
        );
    }
    headers
}

/// GET /api/usage
///
/// Reports the caller's current quota without counting the call. `?ip=`
/// overrides the detected address.
pub async fn get_usage(
    State(state): State<SharedState>,
    Query(params): Query<UsageQuery>,
    headers: HeaderMap,
) -> (HeaderMap, Json<UsageResponse>) {
    let identifier = params
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .unwrap_or_else(|| client_identifier(&headers));

    let decision = state.limiter.evaluate(&identifier, false).await;
    state.metrics.observe("usage", &decision, false);
    tracing::debug!(identifier = %identifier, remaining = decision.remaining, "usage checked");

    // A usage check always succeeds; `admitted` carries the verdict.
    let body = usage_response(&state, true, identifier, decision);
    (rate_limit_headers(&body.decision, body.retry_after_secs), Json(body))
}

/// POST /api/attempt
///
/// Counts one attempt for the caller. Responds 429 when any window is
/// exhausted.
pub async fn post_attempt(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> (StatusCode, HeaderMap, Json<UsageResponse>) {
    let identifier = client_identifier(&headers);
    let decision = state
        .limiter
        .evaluate_with_user_agent(&identifier, true, user_agent(&headers))
        .await;
    state.metrics.observe("attempt", &decision, true);

    let status = if decision.admitted {
        StatusCode::OK
    } else {
        tracing::info!(
            identifier = %identifier,
            window = ?decision.violated_window,
            "attempt rejected"
        );
        StatusCode::TOO_MANY_REQUESTS
    };

    let body = usage_response(&state, decision.admitted, identifier, decision);
    (status, rate_limit_headers(&body.decision, body.retry_after_secs), Json(body))
}
