//! Read side of the activity store.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::activity::{AnalyticsAggregate, LogEntry};
use crate::storage::Storage;
use crate::store::{analytics_key, log_key, Backend, StoreResult, ANALYTICS_PREFIX};

/// Number of identifiers listed in [`AnalyticsSummary::top`].
pub const TOP_IDENTIFIERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub total_identifiers: usize,
    pub total_requests: u64,
    pub total_blocked: u64,
    pub top: Vec<AnalyticsAggregate>,
}

/// Queries over per-identifier aggregates and logs. Read failures degrade to
/// empty results.
#[derive(Clone)]
pub struct AnalyticsReader {
    storage: Arc<Storage>,
}

impl AnalyticsReader {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_one(&self, identifier: &str) -> Option<AnalyticsAggregate> {
        if self.storage.is_disabled() {
            return None;
        }
        let key = analytics_key(identifier);
        match self
            .storage
            .with_fallback("analytics", |backend| backend.read_fields(&key))
            .await
        {
            Ok(fields) => AnalyticsAggregate::from_fields(identifier, &fields),
            Err(e) => {
                warn!(identifier, error = %e, "failed to read analytics");
                None
            }
        }
    }

    /// Every known aggregate, busiest first; ties are ordered by identifier.
    pub async fn get_all(&self) -> Vec<AnalyticsAggregate> {
        if self.storage.is_disabled() {
            return Vec::new();
        }
        match self
            .storage
            .with_fallback("analytics", |backend| collect_all(backend))
            .await
        {
            Ok(mut all) => {
                all.sort_by(|a, b| {
                    b.total_requests
                        .cmp(&a.total_requests)
                        .then_with(|| a.identifier.cmp(&b.identifier))
                });
                all
            }
            Err(e) => {
                warn!(error = %e, "failed to list analytics");
                Vec::new()
            }
        }
    }

    /// Up to `limit` most recent log entries, newest first. Entries that no
    /// longer parse are skipped.
    pub async fn get_log(&self, identifier: &str, limit: usize) -> Vec<LogEntry> {
        if self.storage.is_disabled() || limit == 0 {
            return Vec::new();
        }
        let key = log_key(identifier);
        let raw = match self
            .storage
            .with_fallback("log", |backend| backend.range(&key, limit))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(identifier, error = %e, "failed to read activity log");
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|line| match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(identifier, error = %e, "skipping malformed log entry");
                    None
                }
            })
            .collect()
    }

    pub async fn summary(&self) -> AnalyticsSummary {
        summarize(self.get_all().await)
    }
}

async fn collect_all(backend: &dyn Backend) -> StoreResult<Vec<AnalyticsAggregate>> {
    let mut all = Vec::new();
    for key in backend.keys_matching(ANALYTICS_PREFIX).await? {
        let Some(identifier) = key.strip_prefix(ANALYTICS_PREFIX) else {
            continue;
        };
        let fields = backend.read_fields(&key).await?;
        if let Some(aggregate) = AnalyticsAggregate::from_fields(identifier, &fields) {
            all.push(aggregate);
        }
    }
    Ok(all)
}

/// Totals over `sorted`, which must already be busiest first.
pub fn summarize(sorted: Vec<AnalyticsAggregate>) -> AnalyticsSummary {
    AnalyticsSummary {
        total_identifiers: sorted.len(),
        total_requests: sorted.iter().map(|a| a.total_requests).sum(),
        total_blocked: sorted.iter().map(|a| a.blocked_requests).sum(),
        top: sorted.into_iter().take(TOP_IDENTIFIERS).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::ActivityStore;
    use std::time::Duration;

    fn reader() -> (AnalyticsReader, Arc<Storage>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let storage = Arc::new(Storage::memory(clock));
        (AnalyticsReader::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn unknown_identifier_is_absent() {
        let (reader, _) = reader();
        assert!(reader.get_one("nobody").await.is_none());
        assert!(reader.get_log("nobody", 10).await.is_empty());
        assert_eq!(reader.summary().await.total_identifiers, 0);
    }

    #[tokio::test]
    async fn malformed_log_lines_are_skipped() {
        let (reader, storage) = reader();
        let memory = storage.memory_store();
        let ttl = Duration::from_secs(60);
        let good = r#"{"identifier":"a","timestamp":"1970-01-01T00:00:00.000Z","admitted":true,"violatedWindow":"none","userAgent":"curl"}"#;
        memory.push_capped("ip_logs:a", good.to_string(), 10, ttl).await.unwrap();
        memory.push_capped("ip_logs:a", "{not json".to_string(), 10, ttl).await.unwrap();

        let log = reader.get_log("a", 10).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].user_agent, "curl");
    }

    #[test]
    fn summary_caps_top_list() {
        let aggregates: Vec<AnalyticsAggregate> = (0..12)
            .map(|i| AnalyticsAggregate {
                identifier: format!("10.0.0.{}", i),
                total_requests: 20 - i,
                first_seen: String::new(),
                last_seen: String::new(),
                blocked_requests: 1,
                requests_by_minute: 0,
                requests_by_hour: 0,
                requests_by_day: 0,
            })
            .collect();
        let summary = summarize(aggregates);
        assert_eq!(summary.total_identifiers, 12);
        assert_eq!(summary.total_requests, (9..=20).sum::<u64>());
        assert_eq!(summary.total_blocked, 12);
        assert_eq!(summary.top.len(), TOP_IDENTIFIERS);
        assert_eq!(summary.top[0].identifier, "10.0.0.0");
    }
}
