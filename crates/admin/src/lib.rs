pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use quotaguard_common::AppConfig;
use quotaguard_rate_limit::RateLimiter;
use tower_http::cors::{Any, CorsLayer};

use crate::state::SharedState;

pub use state::{AppState, QuotaMetrics, SharedState as SharedStateType};

/// Build the Axum router with all admin API routes and middleware.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(routes::health::health_check))
        // Prometheus metrics
        .route("/api/metrics", get(routes::metrics::get_metrics))
        // Running configuration
        .route("/api/config", get(routes::config::get_config))
        // Quota checks
        .route("/api/usage", get(routes::usage::get_usage))
        .route("/api/attempt", post(routes::usage::post_attempt))
        // Per-identifier analytics
        .route("/api/analytics", get(routes::analytics::list_analytics))
        .route("/api/analytics/{ip}", get(routes::analytics::get_analytics))
        .route("/api/analytics/{ip}/logs", get(routes::analytics::get_logs))
        // Quota resets
        .route("/api/quota", delete(routes::quota::reset_all))
        .route("/api/quota/{ip}", delete(routes::quota::reset_one))
        // Attach shared state and middleware
        .with_state(state)
        .layer(cors)
}

/// Start the admin API server on the specified address.
///
/// This function will block until the server is shut down.
pub async fn run_admin_server(state: SharedState, listen_addr: &str) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!("admin API server listening on {}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Convenience function to create a SharedState from an AppConfig and a
/// running limiter.
pub fn new_shared_state(config: AppConfig, limiter: Arc<RateLimiter>) -> SharedState {
    Arc::new(AppState::new(config, limiter))
}
