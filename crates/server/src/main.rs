mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use quotaguard_rate_limit::{Clock, RateLimiter, Storage, SystemClock};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ResolvedConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .init();

    // Parse command-line args for config path
    let config_path = std::env::args().nth(1);

    info!(config_path = ?config_path, "starting quotaguard");

    let server_config = ResolvedConfig::load(config_path.as_deref())?;
    let app_config = server_config.config;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = Arc::new(Storage::from_config(&app_config.storage, clock));
    let limiter = Arc::new(RateLimiter::from_config(&app_config.quota, storage)?);

    let interval = Duration::from_secs(app_config.quota.maintenance_interval_secs.max(1));
    let maintenance = limiter.spawn_maintenance(interval);

    let admin_listen = app_config.server.admin.listen.clone();
    let state = quotaguard_admin::new_shared_state(app_config, limiter);

    info!(addr = %admin_listen, "quotaguard started successfully");

    tokio::select! {
        result = quotaguard_admin::run_admin_server(state, &admin_listen) => {
            if let Err(e) = result {
                error!(error = %e, "admin API server error");
                maintenance.abort();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    maintenance.abort();
    Ok(())
}
