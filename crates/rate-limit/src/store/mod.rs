//! Counter and activity storage backends.
//!
//! Every backend implements two capabilities over the same key space:
//!
//! - [`CounterStore`] -- per-bucket request counters with native or swept
//!   expiry, used by the limiter.
//! - [`ActivityStore`] -- capped newest-first lists and field maps, used by
//!   the activity log and analytics aggregates.
//!
//! Backends never decide what to do on failure. They return a [`StoreError`]
//! and [`Storage`](crate::storage::Storage) applies the fallback policy.

pub mod memory;
pub mod redis;
pub mod rest;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::rest::RestStore;

pub const COUNTER_PREFIX: &str = "rate_limit:";
pub const LOG_PREFIX: &str = "ip_logs:";
pub const ANALYTICS_PREFIX: &str = "ip_analytics:";

pub fn log_key(identifier: &str) -> String {
    format!("{}{}", LOG_PREFIX, identifier)
}

pub fn analytics_key(identifier: &str) -> String {
    format!("{}{}", ANALYTICS_PREFIX, identifier)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote store returned status {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("store not configured: {0}")]
    NotConfigured(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Parse a stored counter value; anything unparsable counts as zero.
pub fn parse_count(raw: Option<&str>) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(0)
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Current count for `key`; zero when absent or expired.
    async fn get(&self, key: &str) -> StoreResult<u64>;

    /// Counts for several keys, in order. Backends that can batch override this.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<u64>> {
        let mut counts = Vec::with_capacity(keys.len());
        for key in keys {
            counts.push(self.get(key).await?);
        }
        Ok(counts)
    }

    /// Increment `key` and (re)set its expiry to `ttl`. Returns the new count.
    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> StoreResult<u64>;

    /// Keys starting with `prefix`. Best effort on remote backends.
    async fn keys_matching(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Push `value` to the head of the list at `key`, keep at most `cap`
    /// entries and refresh the key's expiry to `ttl`. A `cap` of zero leaves
    /// no list behind.
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration)
        -> StoreResult<()>;

    /// Keep only the first `keep` entries of the list at `key`; zero deletes
    /// the list.
    async fn trim(&self, key: &str, keep: usize) -> StoreResult<()>;

    /// Up to `limit` entries from the head of the list.
    async fn range(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    /// All fields of the map at `key`; empty when absent.
    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Overwrite the given fields and refresh the key's expiry to `ttl`.
    async fn write_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> StoreResult<()>;
}

/// A full backend: counters plus activity persistence on one key space.
pub trait Backend: CounterStore + ActivityStore {}

impl<T: CounterStore + ActivityStore> Backend for T {}
