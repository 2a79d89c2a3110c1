use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{parse_count, ActivityStore, CounterStore, StoreError, StoreResult};

/// Redis-protocol backend.
///
/// The connection is established lazily on first use and memoized; a failed
/// attempt leaves the cell empty so the next call retries. Every command is
/// bounded by `timeout`, and a timeout is reported like any other failure.
pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
    timeout: Duration,
}

impl RedisStore {
    pub fn open(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            timeout,
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = self
                    .bounded("connect", ConnectionManager::new(self.client.clone()))
                    .await?;
                info!("connected to redis");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = self
            .bounded("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(parse_count(raw.as_deref()))
    }

    /// One pipelined round trip for all keys.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<u64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let raw: Vec<Option<String>> = self.bounded("GET pipeline", pipe.query_async(&mut conn)).await?;
        if raw.len() != keys.len() {
            return Err(StoreError::Malformed(format!(
                "expected {} replies, got {}",
                keys.len(),
                raw.len()
            )));
        }
        debug!(keys = keys.len(), "fetched window counts from redis");
        Ok(raw.iter().map(|v| parse_count(v.as_deref())).collect())
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(key, 1u64)
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore();
        let (count,): (u64,) = self.bounded("INCR", pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn keys_matching(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = self
            .bounded("KEYS", redis::cmd("KEYS").arg(pattern).query_async(&mut conn))
            .await?;
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for RedisStore {
    async fn push_capped(
        &self,
        key: &str,
        value: String,
        cap: usize,
        ttl: Duration,
    ) -> StoreResult<()> {
        if cap == 0 {
            return self.delete(key).await;
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, cap as isize - 1)
            .ignore()
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore();
        let _: () = self.bounded("LPUSH", pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        if keep == 0 {
            return self.delete(key).await;
        }
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(
                "LTRIM",
                redis::cmd("LTRIM")
                    .arg(key)
                    .arg(0)
                    .arg(keep as isize - 1)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn range(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let entries: Vec<String> = self
            .bounded(
                "LRANGE",
                redis::cmd("LRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(limit as isize - 1)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(entries)
    }

    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = self
            .bounded("HGETALL", redis::cmd("HGETALL").arg(key).query_async(&mut conn))
            .await?;
        Ok(fields)
    }

    async fn write_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
        ttl: Duration,
    ) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(key, &fields[..])
            .ignore()
            .expire(key, ttl.as_secs().max(1) as i64)
            .ignore();
        let _: () = self.bounded("HSET", pipe.query_async(&mut conn)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(RedisStore::open("not a url", Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn unreachable_server_reports_error() {
        // Port 1 is reserved and refuses connections on loopback.
        let store = RedisStore::open("redis://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        assert!(store.get("rate_limit:day:x:0").await.is_err());
        assert!(store
            .increment_and_expire("rate_limit:day:x:0", Duration::from_secs(60))
            .await
            .is_err());
    }
}
