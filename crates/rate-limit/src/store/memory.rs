use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ActivityStore, CounterStore, StoreResult};
use crate::clock::Clock;

/// Internal state for a single bucket counter.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at_ms: u64,
}

/// In-process store used in `memory` mode and as the fallback for remote
/// backends.
///
/// Counters expire through a sweep that runs before every read instead of a
/// background timer. Lists and field maps ignore their TTL and live for the
/// lifetime of the process.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    counters: DashMap<String, CounterEntry>,
    lists: DashMap<String, VecDeque<String>>,
    maps: DashMap<String, HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: DashMap::new(),
            lists: DashMap::new(),
            maps: DashMap::new(),
        }
    }

    /// Drop every counter whose expiry has passed.
    pub fn sweep_expired(&self) {
        let now = self.clock.now_millis();
        self.counters.retain(|_key, entry| entry.expires_at_ms > now);
    }

    /// Number of counter entries, including expired ones not yet swept.
    pub fn counter_len(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        self.sweep_expired();
        Ok(self.counters.get(key).map(|e| e.count).unwrap_or(0))
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.sweep_expired();
        let expires_at_ms = self
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);

        let mut entry = self.counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at_ms,
        });
        entry.count += 1;
        entry.expires_at_ms = expires_at_ms;
        Ok(entry.count)
    }

    async fn keys_matching(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.sweep_expired();
        let mut keys: Vec<String> = self
            .counters
            .iter()
            .map(|e| e.key().clone())
            .chain(self.lists.iter().map(|e| e.key().clone()))
            .chain(self.maps.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.counters.remove(key);
        self.lists.remove(key);
        self.maps.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn push_capped(
        &self,
        key: &str,
        value: String,
        cap: usize,
        _ttl: Duration,
    ) -> StoreResult<()> {
        if cap == 0 {
            self.lists.remove(key);
            return Ok(());
        }
        let mut list = self.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.truncate(cap);
        Ok(())
    }

    async fn trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        if keep == 0 {
            self.lists.remove(key);
        } else if let Some(mut list) = self.lists.get_mut(key) {
            list.truncate(keep);
        }
        Ok(())
    }

    async fn range(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        Ok(self.maps.get(key).map(|m| m.clone()).unwrap_or_default())
    }

    async fn write_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        _ttl: Duration,
    ) -> StoreResult<()> {
        self.maps.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }
}
