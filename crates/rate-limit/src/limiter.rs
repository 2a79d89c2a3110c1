//! Multi-window admission decisions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quotaguard_common::{QuotaConfig, QuotaError, QuotaResult, WindowName};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::activity::ActivityLogger;
use crate::storage::Storage;
use crate::store::{Backend, StoreError, StoreResult, COUNTER_PREFIX};
use crate::window::WindowSpec;

/// Remaining quota reported while the limiter is disabled.
pub const DISABLED_REMAINING: u64 = 999;

/// Outcome of one evaluation. Produced fresh per call; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub admitted: bool,
    pub remaining: u64,
    /// Epoch milliseconds at which capacity is next renewed.
    pub reset_at: u64,
    pub violated_window: Option<WindowName>,
    pub counts_by_window: BTreeMap<WindowName, u64>,
}

impl RateLimitDecision {
    /// Whole seconds until `reset_at`, rounded up.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms).div_ceil(1000)
    }

    fn unlimited(reset_at: u64) -> Self {
        Self {
            admitted: true,
            remaining: DISABLED_REMAINING,
            reset_at,
            violated_window: None,
            counts_by_window: BTreeMap::new(),
        }
    }
}

/// Fixed-bucket limiter over an ordered list of windows.
///
/// Every window must have headroom for a request to be admitted; the first
/// exhausted window in configured order is reported as the violation. An
/// admitted consuming call increments every window.
pub struct RateLimiter {
    windows: Vec<WindowSpec>,
    storage: Arc<Storage>,
    activity: ActivityLogger,
}

impl RateLimiter {
    pub fn new(
        windows: Vec<WindowSpec>,
        storage: Arc<Storage>,
        activity: ActivityLogger,
    ) -> QuotaResult<Self> {
        if windows.is_empty() {
            return Err(QuotaError::Config("at least one window is required".to_string()));
        }
        if let Some(w) = windows.iter().find(|w| w.duration_ms == 0) {
            return Err(QuotaError::Config(format!("window '{}' has a zero duration", w.name)));
        }
        for (i, w) in windows.iter().enumerate() {
            if windows[..i].iter().any(|other| other.name == w.name) {
                return Err(QuotaError::Config(format!("window '{}' is configured twice", w.name)));
            }
        }

        info!(
            windows = ?windows.iter().map(|w| (w.name.as_str(), w.ceiling)).collect::<Vec<_>>(),
            backend = storage.kind().as_str(),
            "creating multi-window rate limiter"
        );

        Ok(Self {
            windows,
            storage,
            activity,
        })
    }

    pub fn from_config(config: &QuotaConfig, storage: Arc<Storage>) -> QuotaResult<Self> {
        let windows = config.windows.iter().map(WindowSpec::from).collect();
        let activity = ActivityLogger::new(storage.clone(), config.log_depth, config.retention());
        Self::new(windows, storage, activity)
    }

    pub fn windows(&self) -> &[WindowSpec] {
        &self.windows
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn activity(&self) -> &ActivityLogger {
        &self.activity
    }

    pub fn now_millis(&self) -> u64 {
        self.storage.clock().now_millis()
    }

    /// Decide whether `identifier` may proceed. With `consume` the attempt is
    /// counted and logged; without it the call only reports.
    pub async fn evaluate(&self, identifier: &str, consume: bool) -> RateLimitDecision {
        self.evaluate_with_user_agent(identifier, consume, None).await
    }

    pub async fn evaluate_with_user_agent(
        &self,
        identifier: &str,
        consume: bool,
        user_agent: Option<&str>,
    ) -> RateLimitDecision {
        let now = self.now_millis();

        if self.storage.is_disabled() {
            return RateLimitDecision::unlimited(self.windows[0].reset_at(now));
        }

        let decision = match self
            .storage
            .with_fallback("evaluate", |backend| self.decide(backend, identifier, consume, now))
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                // Both stores failed: admit and record nothing.
                warn!(identifier, error = %e, "counter stores unavailable, admitting");
                return RateLimitDecision {
                    admitted: true,
                    remaining: self.windows.iter().map(|w| w.ceiling).min().unwrap_or(0),
                    reset_at: self.windows[0].reset_at(now),
                    violated_window: None,
                    counts_by_window: BTreeMap::new(),
                };
            }
        };

        if consume {
            self.activity
                .record_with_user_agent(
                    identifier,
                    decision.admitted,
                    decision.violated_window,
                    user_agent,
                )
                .await;
        }

        debug!(
            identifier,
            consume,
            admitted = decision.admitted,
            remaining = decision.remaining,
            violated_window = ?decision.violated_window,
            "rate limit evaluated"
        );

        decision
    }

    async fn decide(
        &self,
        backend: &dyn Backend,
        identifier: &str,
        consume: bool,
        now: u64,
    ) -> StoreResult<RateLimitDecision> {
        let keys: Vec<String> = self
            .windows
            .iter()
            .map(|w| w.counter_key(identifier, now))
            .collect();
        let counts = backend.get_many(&keys).await?;
        let counts_by_window: BTreeMap<WindowName, u64> = self
            .windows
            .iter()
            .zip(&counts)
            .map(|(w, &c)| (w.name, c))
            .collect();

        if let Some(window) = self
            .windows
            .iter()
            .zip(&counts)
            .find(|&(w, &count)| count >= w.ceiling)
            .map(|(w, _)| w)
        {
            return Ok(RateLimitDecision {
                admitted: false,
                remaining: 0,
                reset_at: window.reset_at(now),
                violated_window: Some(window.name),
                counts_by_window,
            });
        }

        if consume {
            for (window, key) in self.windows.iter().zip(&keys) {
                backend.increment_and_expire(key, window.ttl()).await?;
            }
        }

        let used = u64::from(consume);
        let remaining = self
            .windows
            .iter()
            .zip(&counts)
            .map(|(w, &count)| w.ceiling.saturating_sub(count + used))
            .min()
            .unwrap_or(0);

        Ok(RateLimitDecision {
            admitted: true,
            remaining,
            reset_at: self.windows[0].reset_at(now),
            violated_window: None,
            counts_by_window,
        })
    }

    /// Delete quota counters for one identifier, or for everyone when
    /// `identifier` is `None`. Activity history is kept. Returns the number
    /// of counters removed.
    pub async fn reset(&self, identifier: Option<&str>) -> usize {
        if self.storage.is_disabled() {
            return 0;
        }

        let removed = self
            .storage
            .with_fallback("reset", |backend| async move {
                let mut removed = 0usize;
                for key in backend.keys_matching(COUNTER_PREFIX).await? {
                    if identifier.is_some_and(|id| !counter_belongs_to(&key, id)) {
                        continue;
                    }
                    backend.delete(&key).await?;
                    removed += 1;
                }
                Ok::<_, StoreError>(removed)
            })
            .await;

        match removed {
            Ok(removed) => {
                info!(identifier = identifier.unwrap_or("*"), removed, "quota counters reset");
                removed
            }
            Err(e) => {
                warn!(error = %e, "quota reset failed");
                0
            }
        }
    }

    /// One maintenance pass: evict expired in-process counters and prune old
    /// activity log entries.
    pub async fn run_maintenance(&self) {
        let memory = self.storage.memory_store();
        let before = memory.counter_len();
        memory.sweep_expired();
        let pruned = self.activity.cleanup_older_than(self.activity.retention()).await;

        debug!(
            evicted = before.saturating_sub(memory.counter_len()),
            pruned,
            "rate limiter maintenance tick completed"
        );
    }

    /// Spawn a background task that runs [`run_maintenance`](Self::run_maintenance)
    /// every `interval` until the runtime shuts down.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.run_maintenance().await;
                trace!("maintenance tick");
            }
        })
    }
}

/// Whether `key` (`rate_limit:<window>:<identifier>:<bucket>`) counts for
/// `identifier`. Identifiers may themselves contain colons (IPv6).
fn counter_belongs_to(key: &str, identifier: &str) -> bool {
    let Some(rest) = key.strip_prefix(COUNTER_PREFIX) else {
        return false;
    };
    let Some((_, rest)) = rest.split_once(':') else {
        return false;
    };
    match rest.rsplit_once(':') {
        Some((id, _bucket)) => id == identifier,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn limiter(windows: Vec<WindowSpec>) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let storage = Arc::new(Storage::memory(clock.clone() as Arc<dyn Clock>));
        let activity = ActivityLogger::new(storage.clone(), 100, Duration::from_secs(86_400));
        (RateLimiter::new(windows, storage, activity).unwrap(), clock)
    }

    #[test]
    fn rejects_empty_window_list() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let storage = Arc::new(Storage::memory(clock));
        let activity = ActivityLogger::new(storage.clone(), 100, Duration::from_secs(60));
        assert!(RateLimiter::new(Vec::new(), storage, activity).is_err());
    }

    #[test]
    fn rejects_duplicate_window_names() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let storage = Arc::new(Storage::memory(clock));
        let activity = ActivityLogger::new(storage.clone(), 100, Duration::from_secs(60));
        let windows = vec![WindowSpec::day(2), WindowSpec::hour(1), WindowSpec::day(5)];
        assert!(RateLimiter::new(windows, storage, activity).is_err());
    }

    #[test]
    fn retry_after_rounds_up() {
        let decision = RateLimitDecision::unlimited(10_001);
        assert_eq!(decision.retry_after_secs(0), 11);
        assert_eq!(decision.retry_after_secs(10_000), 1);
        assert_eq!(decision.retry_after_secs(20_000), 0);
    }

    #[test]
    fn counter_ownership_handles_colons() {
        assert!(counter_belongs_to("rate_limit:day:1.2.3.4:7", "1.2.3.4"));
        assert!(counter_belongs_to("rate_limit:minute:::1:7", "::1"));
        assert!(!counter_belongs_to("rate_limit:day:1.2.3.45:7", "1.2.3.4"));
        assert!(!counter_belongs_to("ip_logs:1.2.3.4", "1.2.3.4"));
    }

    #[tokio::test]
    async fn check_only_reports_without_counting() {
        let (limiter, _) = limiter(vec![WindowSpec::day(2)]);

        let first = limiter.evaluate("a", false).await;
        let second = limiter.evaluate("a", false).await;
        assert_eq!(first, second);
        assert!(first.admitted);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.counts_by_window.get(&WindowName::Day), Some(&0));
    }

    #[tokio::test]
    async fn remaining_takes_scarcest_window() {
        let (limiter, _) = limiter(vec![WindowSpec::hour(3), WindowSpec::day(10)]);

        let decision = limiter.evaluate("a", true).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at, 3_600_000);
    }

    #[tokio::test]
    async fn reset_clears_only_named_identifier() {
        let (limiter, _) = limiter(vec![WindowSpec::day(1)]);
        limiter.evaluate("a", true).await;
        limiter.evaluate("b", true).await;

        assert_eq!(limiter.reset(Some("a")).await, 1);
        assert!(limiter.evaluate("a", false).await.admitted);
        assert!(!limiter.evaluate("b", false).await.admitted);

        assert_eq!(limiter.reset(None).await, 1);
        assert!(limiter.evaluate("b", false).await.admitted);
    }

    #[tokio::test]
    async fn maintenance_evicts_expired_counters() {
        let (limiter, clock) = limiter(vec![WindowSpec::minute(5)]);
        limiter.evaluate("a", true).await;
        assert_eq!(limiter.storage().memory_store().counter_len(), 1);

        clock.advance(120_000);
        limiter.run_maintenance().await;
        assert_eq!(limiter.storage().memory_store().counter_len(), 0);
    }
}
