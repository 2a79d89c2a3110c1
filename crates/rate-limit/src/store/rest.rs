use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{parse_count, ActivityStore, CounterStore, StoreError, StoreResult};

/// Backend for Redis-compatible stores reachable only over HTTPS (Upstash
/// REST API).
///
/// A single command is a `POST <base>` with a JSON array body such as
/// `["INCR", "key"]`; batches go to `POST <base>/pipeline` as an array of such
/// arrays. Replies are `{"result": ...}` or `{"error": "..."}`.
pub struct RestStore {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl RestReply {
    fn into_result(self) -> StoreResult<Value> {
        match self.error {
            Some(message) => Err(StoreError::Remote {
                status: 200,
                message,
            }),
            None => Ok(self.result),
        }
    }
}

impl RestStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> StoreResult<Self> {
        if base_url.trim().is_empty() {
            return Err(StoreError::NotConfigured("REST URL is empty".to_string()));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn post(&self, url: String, body: Value) -> StoreResult<reqwest::Response> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<RestReply>().await {
                Ok(RestReply { error: Some(e), .. }) => e,
                _ => status.canonical_reason().unwrap_or("request failed").to_string(),
            };
            return Err(StoreError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn command(&self, args: Value) -> StoreResult<Value> {
        let reply: RestReply = self.post(self.base_url.clone(), args).await?.json().await?;
        reply.into_result()
    }

    async fn pipeline(&self, commands: Vec<Value>) -> StoreResult<Vec<Value>> {
        let expected = commands.len();
        let url = format!("{}/pipeline", self.base_url);
        let replies: Vec<RestReply> = self.post(url, Value::Array(commands)).await?.json().await?;
        if replies.len() != expected {
            return Err(StoreError::Malformed(format!(
                "expected {} pipeline replies, got {}",
                expected,
                replies.len()
            )));
        }
        replies.into_iter().map(RestReply::into_result).collect()
    }
}

fn count_from(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => parse_count(Some(s)),
        _ => 0,
    }
}

fn strings_from(value: Value) -> StoreResult<Vec<String>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(StoreError::Malformed(format!("expected string, got {}", other))),
            })
            .collect(),
        other => Err(StoreError::Malformed(format!("expected array, got {}", other))),
    }
}

/// HGETALL arrives as a flat `[field, value, ...]` array; some proxies send an
/// object instead.
fn fields_from(value: Value) -> StoreResult<HashMap<String, String>> {
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect()),
        other => {
            let flat = strings_from(other)?;
            if flat.len() % 2 != 0 {
                return Err(StoreError::Malformed(
                    "odd number of elements in field list".to_string(),
                ));
            }
            Ok(flat
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect())
        }
    }
}

#[async_trait]
impl CounterStore for RestStore {
    fn name(&self) -> &'static str {
        "upstash-rest"
    }

    async fn get(&self, key: &str) -> StoreResult<u64> {
        let value = self.command(json!(["GET", key])).await?;
        Ok(count_from(&value))
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<u64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let commands = keys.iter().map(|k| json!(["GET", k])).collect();
        let values = self.pipeline(commands).await?;
        debug!(keys = keys.len(), "fetched window counts over REST");
        Ok(values.iter().map(count_from).collect())
    }

    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let ttl_secs = ttl.as_secs().max(1);
        let values = self
            .pipeline(vec![json!(["INCR", key]), json!(["EXPIRE", key, ttl_secs])])
            .await?;
        match values.first() {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| StoreError::Malformed(format!("INCR returned {}", n))),
            other => Err(StoreError::Malformed(format!("INCR returned {:?}", other))),
        }
    }

    async fn keys_matching(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let value = self.command(json!(["KEYS", format!("{}*", prefix)])).await?;
        strings_from(value)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for RestStore {
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
        let stop = cap - 1;
        self.pipeline(vec![
            json!(["LPUSH", key, value]),
            json!(["LTRIM", key, 0, stop]),
            json!(["EXPIRE", key, ttl.as_secs().max(1)]),
        ])
        .await?;
        Ok(())
    }

    async fn trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        if keep == 0 {
            return self.delete(key).await;
        }
        self.command(json!(["LTRIM", key, 0, keep - 1])).await?;
        Ok(())
    }

    async fn range(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let value = self.command(json!(["LRANGE", key, 0, limit - 1])).await?;
        strings_from(value)
    }

    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let value = self.command(json!(["HGETALL", key])).await?;
        fields_from(value)
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
        let mut hset = vec![json!("HSET"), json!(key)];
        for (field, value) in fields {
            hset.push(Value::String(field));
            hset.push(Value::String(value));
        }
        self.pipeline(vec![
            Value::Array(hset),
            json!(["EXPIRE", key, ttl.as_secs().max(1)]),
        ])
        .await?;
        Ok(())
    }
}
