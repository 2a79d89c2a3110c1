//! Per-identifier request log and running analytics aggregate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use quotaguard_common::WindowName;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::Storage;
use crate::store::{analytics_key, log_key, Backend, StoreResult, LOG_PREFIX};

pub const UNKNOWN_USER_AGENT: &str = "unknown";
pub const NO_VIOLATION: &str = "none";

/// One recorded evaluation, stored as JSON in the identifier's log list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(alias = "ip")]
    pub identifier: String,
    pub timestamp: String,
    #[serde(alias = "allowed")]
    pub admitted: bool,
    /// Name of the violated window, or `"none"` when admitted.
    #[serde(alias = "limitType")]
    pub violated_window: String,
    #[serde(default = "unknown_user_agent")]
    pub user_agent: String,
}

fn unknown_user_agent() -> String {
    UNKNOWN_USER_AGENT.to_string()
}

impl LogEntry {
    fn timestamp_millis(&self) -> Option<i64> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.timestamp_millis())
    }
}

/// Running totals for one identifier.
///
/// The per-window request fields are carried for record compatibility and
/// are not maintained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsAggregate {
    pub identifier: String,
    pub total_requests: u64,
    pub first_seen: String,
    pub last_seen: String,
    pub blocked_requests: u64,
    pub requests_by_minute: u64,
    pub requests_by_hour: u64,
    pub requests_by_day: u64,
}

const TOTAL_REQUESTS: &str = "totalRequests";
const FIRST_SEEN: &str = "firstSeen";
const LAST_SEEN: &str = "lastSeen";
const BLOCKED_REQUESTS: &str = "blockedRequests";
const REQUESTS_BY_MINUTE: &str = "requestsByMinute";
const REQUESTS_BY_HOUR: &str = "requestsByHour";
const REQUESTS_BY_DAY: &str = "requestsByDay";

fn field_count(fields: &HashMap<String, String>, name: &str) -> u64 {
    crate::store::parse_count(fields.get(name).map(String::as_str))
}

impl AnalyticsAggregate {
    fn first(identifier: &str, timestamp: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            total_requests: 0,
            first_seen: timestamp.to_string(),
            last_seen: timestamp.to_string(),
            blocked_requests: 0,
            requests_by_minute: 0,
            requests_by_hour: 0,
            requests_by_day: 0,
        }
    }

    /// Rebuild an aggregate from its stored field map. Absent when the map has
    /// no request total; unparsable numbers read as zero.
    pub fn from_fields(identifier: &str, fields: &HashMap<String, String>) -> Option<Self> {
        fields.get(TOTAL_REQUESTS)?;
        let last_seen = fields.get(LAST_SEEN).cloned().unwrap_or_default();
        Some(Self {
            identifier: identifier.to_string(),
            total_requests: field_count(fields, TOTAL_REQUESTS),
            first_seen: fields.get(FIRST_SEEN).cloned().unwrap_or_else(|| last_seen.clone()),
            last_seen,
            blocked_requests: field_count(fields, BLOCKED_REQUESTS),
            requests_by_minute: field_count(fields, REQUESTS_BY_MINUTE),
            requests_by_hour: field_count(fields, REQUESTS_BY_HOUR),
            requests_by_day: field_count(fields, REQUESTS_BY_DAY),
        })
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (TOTAL_REQUESTS.to_string(), self.total_requests.to_string()),
            (FIRST_SEEN.to_string(), self.first_seen.clone()),
            (LAST_SEEN.to_string(), self.last_seen.clone()),
            (BLOCKED_REQUESTS.to_string(), self.blocked_requests.to_string()),
            (REQUESTS_BY_MINUTE.to_string(), self.requests_by_minute.to_string()),
            (REQUESTS_BY_HOUR.to_string(), self.requests_by_hour.to_string()),
            (REQUESTS_BY_DAY.to_string(), self.requests_by_day.to_string()),
        ]
    }

    fn apply(&mut self, admitted: bool, timestamp: &str) {
        self.total_requests += 1;
        if !admitted {
            self.blocked_requests += 1;
        }
        self.last_seen = timestamp.to_string();
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn iso_timestamp(millis: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Appends to the bounded log and maintains the aggregate for each
/// identifier. Recording is best effort: failures are absorbed by the
/// storage fallback and, failing that, dropped with a warning.
pub struct ActivityLogger {
    storage: Arc<Storage>,
    log_depth: usize,
    retention: Duration,
}

impl ActivityLogger {
    pub fn new(storage: Arc<Storage>, log_depth: usize, retention: Duration) -> Self {
        Self {
            storage,
            log_depth: log_depth.max(1),
            retention,
        }
    }

    pub fn log_depth(&self) -> usize {
        self.log_depth
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn record(&self, identifier: &str, admitted: bool, violated: Option<WindowName>) {
        self.record_with_user_agent(identifier, admitted, violated, None)
            .await;
    }

    pub async fn record_with_user_agent(
        &self,
        identifier: &str,
        admitted: bool,
        violated: Option<WindowName>,
        user_agent: Option<&str>,
    ) {
        if self.storage.is_disabled() {
            return;
        }

        let entry = LogEntry {
            identifier: identifier.to_string(),
            timestamp: iso_timestamp(self.storage.clock().now_millis()),
            admitted,
            violated_window: violated
                .map(|w| w.as_str())
                .unwrap_or(NO_VIOLATION)
                .to_string(),
            user_agent: user_agent.unwrap_or(UNKNOWN_USER_AGENT).to_string(),
        };

        let encoded = match serde_json::to_string(&entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(identifier, error = %e, "failed to encode log entry");
                return;
            }
        };

        let result = self
            .storage
            .with_fallback("record", |backend| self.persist(backend, &entry, &encoded))
            .await;

        match result {
            Ok(()) => debug!(
                identifier,
                admitted,
                violated_window = %entry.violated_window,
                "activity recorded"
            ),
            Err(e) => warn!(identifier, error = %e, "dropping activity record"),
        }
    }

    async fn persist(&self, backend: &dyn Backend, entry: &LogEntry, encoded: &str) -> StoreResult<()> {
        backend
            .push_capped(
                &log_key(&entry.identifier),
                encoded.to_string(),
                self.log_depth,
                self.retention,
            )
            .await?;

        let key = analytics_key(&entry.identifier);
        let fields = backend.read_fields(&key).await?;
        let mut aggregate = AnalyticsAggregate::from_fields(&entry.identifier, &fields)
            .unwrap_or_else(|| AnalyticsAggregate::first(&entry.identifier, &entry.timestamp));
        aggregate.apply(entry.admitted, &entry.timestamp);

        backend
            .write_fields(&key, aggregate.to_fields(), self.retention)
            .await
    }

    /// Trim every log list so that only entries newer than `max_age`
    /// remain; lists left empty are deleted. Returns the number of entries
    /// removed.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        if self.storage.is_disabled() {
            return 0;
        }
        let now = self.storage.clock().now_millis();
        let cutoff = now.saturating_sub(max_age.as_millis() as u64) as i64;

        match self
            .storage
            .with_fallback("cleanup", |backend| self.cleanup_on(backend, cutoff))
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "pruned expired activity log entries");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "activity log cleanup failed");
                0
            }
        }
    }

    async fn cleanup_on(&self, backend: &dyn Backend, cutoff_ms: i64) -> StoreResult<usize> {
        let mut removed = 0;
        for key in backend.keys_matching(LOG_PREFIX).await? {
            let raw = backend.range(&key, self.log_depth).await?;
            // Newest first: everything from the first stale or unreadable
            // entry onward goes.
            let kept = raw
                .iter()
                .take_while(|line| {
                    serde_json::from_str::<LogEntry>(line)
                        .ok()
                        .and_then(|e| e.timestamp_millis())
                        .is_some_and(|ts| ts > cutoff_ms)
                })
                .count();

            if kept == raw.len() {
                continue;
            }
            backend.trim(&key, kept).await?;
            removed += raw.len() - kept;
        }
        Ok(removed)
    }
}
