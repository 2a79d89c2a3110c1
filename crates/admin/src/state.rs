use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use quotaguard_common::AppConfig;
use quotaguard_rate_limit::{AnalyticsReader, RateLimitDecision, RateLimiter};

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Central application state: the running limiter, its analytics view and
/// the metrics registry.
pub struct AppState {
    pub config: AppConfig,
    pub limiter: Arc<RateLimiter>,
    pub analytics: AnalyticsReader,
    pub metrics: QuotaMetrics,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics for quota decisions.
pub struct QuotaMetrics {
    pub registry: Registry,
    pub decisions_total: IntCounterVec,
    pub rejections_total: IntCounterVec,
    pub quota_resets_total: IntCounter,
    pub store_fallbacks: IntGauge,
}

impl QuotaMetrics {
    /// Create a new QuotaMetrics instance with all collectors registered
    /// against a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new("quotaguard_decisions_total", "Quota decisions by endpoint and outcome"),
            &["endpoint", "outcome"],
        )
        .expect("failed to create decisions_total metric");

        let rejections_total = IntCounterVec::new(
            Opts::new("quotaguard_rejections_total", "Rejected attempts by violated window"),
            &["window"],
        )
        .expect("failed to create rejections_total metric");

        let quota_resets_total = IntCounter::new(
            "quotaguard_quota_resets_total",
            "Quota resets issued through the admin API",
        )
        .expect("failed to create quota_resets_total metric");

        let store_fallbacks = IntGauge::new(
            "quotaguard_store_fallbacks",
            "Store operations re-run against the in-process store",
        )
        .expect("failed to create store_fallbacks metric");

        registry.register(Box::new(decisions_total.clone())).expect("failed to register decisions_total");
        registry.register(Box::new(rejections_total.clone())).expect("failed to register rejections_total");
        registry.register(Box::new(quota_resets_total.clone())).expect("failed to register quota_resets_total");
        registry.register(Box::new(store_fallbacks.clone())).expect("failed to register store_fallbacks");

        Self {
            registry,
            decisions_total,
            rejections_total,
            quota_resets_total,
            store_fallbacks,
        }
    }

    /// Count a decision under `endpoint`. Rejections per window are only
    /// counted for decisions that consumed quota.
    pub fn observe(&self, endpoint: &str, decision: &RateLimitDecision, consumed: bool) {
        let outcome = if decision.admitted { "admitted" } else { "rejected" };
        self.decisions_total.with_label_values(&[endpoint, outcome]).inc();
        if !consumed {
            return;
        }
        if let Some(window) = decision.violated_window {
            self.rejections_total.with_label_values(&[window.as_str()]).inc();
        }
    }
}

impl Default for QuotaMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(config: AppConfig, limiter: Arc<RateLimiter>) -> Self {
        let analytics = AnalyticsReader::new(limiter.storage().clone());
        Self {
            config,
            limiter,
            analytics,
            metrics: QuotaMetrics::new(),
            start_time: std::time::Instant::now(),
        }
    }
}
