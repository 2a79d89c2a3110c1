use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use quotaguard_common::{StorageBackend, WindowName};
use quotaguard_rate_limit::activity::iso_timestamp;
use quotaguard_rate_limit::store::{ActivityStore, CounterStore};
use quotaguard_rate_limit::{
    ActivityLogger, AnalyticsReader, Clock, LogEntry, ManualClock, MemoryStore, RateLimiter,
    RestStore, Storage, StoreError, StoreResult, WindowSpec,
};
use serde_json::{json, Value};

const DAY_MS: u64 = 86_400_000;
const START: u64 = 20_000 * DAY_MS + 5_000;

struct Harness {
    limiter: RateLimiter,
    reader: AnalyticsReader,
    storage: Arc<Storage>,
    clock: Arc<ManualClock>,
}

fn harness_with(storage: impl FnOnce(Arc<dyn Clock>) -> Storage, windows: Vec<WindowSpec>) -> Harness {
    let clock = Arc::new(ManualClock::new(START));
    let storage = Arc::new(storage(clock.clone() as Arc<dyn Clock>));
    let activity = ActivityLogger::new(storage.clone(), 100, Duration::from_secs(30 * 86_400));
    let limiter = RateLimiter::new(windows, storage.clone(), activity).unwrap();
    Harness {
        limiter,
        reader: AnalyticsReader::new(storage.clone()),
        storage,
        clock,
    }
}

fn harness(windows: Vec<WindowSpec>) -> Harness {
    harness_with(Storage::memory, windows)
}

#[tokio::test]
async fn test_minute_hour_day_ceilings() {
    let h = harness(vec![WindowSpec::minute(1), WindowSpec::hour(20), WindowSpec::day(50)]);

    let first = h.limiter.evaluate("1.2.3.4", true).await;
    assert!(first.admitted);
    assert_eq!(first.remaining, 0);
    assert_eq!(first.violated_window, None);

    let second = h.limiter.evaluate("1.2.3.4", true).await;
    assert!(!second.admitted);
    assert_eq!(second.violated_window, Some(WindowName::Minute));
    assert_eq!(second.remaining, 0);
    assert_eq!(second.reset_at, START - 5_000 + 60_000);
    assert_eq!(second.retry_after_secs(START), 55);

    h.clock.advance(60_000);
    let third = h.limiter.evaluate("1.2.3.4", true).await;
    assert!(third.admitted);
    assert_eq!(third.counts_by_window[&WindowName::Hour], 1);
    assert_eq!(third.counts_by_window[&WindowName::Day], 1);
}

#[tokio::test]
async fn test_day_ceiling_resets_at_next_day() {
    let h = harness(vec![WindowSpec::day(5)]);

    for expected in (0..5).rev() {
        let decision = h.limiter.evaluate("client", true).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining, expected);
    }

    let sixth = h.limiter.evaluate("client", true).await;
    assert!(!sixth.admitted);
    assert_eq!(sixth.violated_window, Some(WindowName::Day));
    assert_eq!(sixth.reset_at, 20_001 * DAY_MS);

    h.clock.set(20_001 * DAY_MS);
    assert!(h.limiter.evaluate("client", true).await.admitted);
}

#[tokio::test]
async fn test_identifiers_are_independent() {
    let h = harness(vec![WindowSpec::day(1)]);
    assert!(h.limiter.evaluate("a", true).await.admitted);
    assert!(!h.limiter.evaluate("a", true).await.admitted);
    assert!(h.limiter.evaluate("b", true).await.admitted);
}

#[tokio::test]
async fn test_check_only_does_not_count_or_log() {
    let h = harness(vec![WindowSpec::day(5)]);
    h.limiter.evaluate("client", true).await;
    h.limiter.evaluate("client", true).await;

    let first = h.limiter.evaluate("client", false).await;
    let second = h.limiter.evaluate("client", false).await;
    assert_eq!(first, second);
    assert_eq!(first.remaining, 3);

    assert_eq!(h.reader.get_log("client", 100).await.len(), 2);
    assert_eq!(h.reader.get_one("client").await.unwrap().total_requests, 2);
}

#[tokio::test]
async fn test_check_only_reports_rejection_without_logging() {
    let h = harness(vec![WindowSpec::day(1)]);
    h.limiter.evaluate("client", true).await;

    let check = h.limiter.evaluate("client", false).await;
    assert!(!check.admitted);
    assert_eq!(check.violated_window, Some(WindowName::Day));
    assert_eq!(h.reader.get_one("client").await.unwrap().blocked_requests, 0);
}

#[tokio::test]
async fn test_log_is_capped_newest_first() {
    let h = harness(vec![WindowSpec::day(1_000)]);
    for _ in 0..150 {
        h.limiter.evaluate("busy", true).await;
        h.clock.advance(1);
    }

    let log = h.reader.get_log("busy", 500).await;
    assert_eq!(log.len(), 100);
    assert_eq!(log[0].timestamp, iso_timestamp(START + 149));
    assert_eq!(log[99].timestamp, iso_timestamp(START + 50));

    let aggregate = h.reader.get_one("busy").await.unwrap();
    assert_eq!(aggregate.total_requests, 150);
    assert_eq!(aggregate.first_seen, iso_timestamp(START));
    assert_eq!(aggregate.last_seen, iso_timestamp(START + 149));
}

#[tokio::test]
async fn test_blocked_requests_are_counted() {
    let h = harness(vec![WindowSpec::day(2)]);
    for _ in 0..5 {
        h.limiter
            .evaluate_with_user_agent("1.1.1.1", true, Some("curl/8.0"))
            .await;
    }

    let aggregate = h.reader.get_one("1.1.1.1").await.unwrap();
    assert_eq!(aggregate.total_requests, 5);
    assert_eq!(aggregate.blocked_requests, 3);

    let log = h.reader.get_log("1.1.1.1", 10).await;
    assert!(!log[0].admitted);
    assert_eq!(log[0].violated_window, "day");
    assert_eq!(log[0].user_agent, "curl/8.0");
    assert!(log[4].admitted);
    assert_eq!(log[4].violated_window, "none");
}

#[tokio::test]
async fn test_get_all_orders_by_total_and_summarizes() {
    let h = harness(vec![WindowSpec::day(100)]);
    for _ in 0..3 {
        h.limiter.evaluate("a", true).await;
    }
    for _ in 0..10 {
        h.limiter.evaluate("b", true).await;
    }

    let all = h.reader.get_all().await;
    let order: Vec<&str> = all.iter().map(|a| a.identifier.as_str()).collect();
    assert_eq!(order, vec!["b", "a"]);

    let summary = h.reader.summary().await;
    assert_eq!(summary.total_identifiers, 2);
    assert_eq!(summary.total_requests, 13);
    assert_eq!(summary.total_blocked, 0);
    assert_eq!(summary.top[0].identifier, "b");
}

#[tokio::test]
async fn test_disabled_mode_is_inert() {
    let h = harness_with(Storage::disabled, vec![WindowSpec::day(1)]);
    for _ in 0..10 {
        let decision = h.limiter.evaluate("client", true).await;
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 999);
    }
    assert!(h.reader.get_one("client").await.is_none());
    assert!(h.reader.get_all().await.is_empty());
    assert_eq!(h.limiter.reset(None).await, 0);
}

#[tokio::test]
async fn test_cleanup_drops_old_log_entries() {
    let h = harness(vec![WindowSpec::day(100)]);
    h.limiter.evaluate("old", true).await;
    h.limiter.evaluate("mixed", true).await;

    h.clock.advance(31 * DAY_MS);
    h.limiter.evaluate("mixed", true).await;

    let removed = h
        .limiter
        .activity()
        .cleanup_older_than(Duration::from_secs(30 * 86_400))
        .await;
    assert_eq!(removed, 2);
    assert!(h.reader.get_log("old", 10).await.is_empty());
    assert_eq!(h.reader.get_log("mixed", 10).await.len(), 1);
}

/// Backend whose every operation fails, standing in for an unreachable server.
struct FailingStore;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::NotConfigured("unreachable".to_string()))
}

#[async_trait]
impl CounterStore for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }
    async fn get(&self, _key: &str) -> StoreResult<u64> {
        unavailable()
    }
    async fn increment_and_expire(&self, _key: &str, _ttl: Duration) -> StoreResult<u64> {
        unavailable()
    }
    async fn keys_matching(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        unavailable()
    }
    async fn delete(&self, _key: &str) -> StoreResult<()> {
        unavailable()
    }
}

#[async_trait]
impl ActivityStore for FailingStore {
    async fn push_capped(&self, _: &str, _: String, _: usize, _: Duration) -> StoreResult<()> {
        unavailable()
    }
    async fn trim(&self, _key: &str, _keep: usize) -> StoreResult<()> {
        unavailable()
    }
    async fn range(&self, _key: &str, _limit: usize) -> StoreResult<Vec<String>> {
        unavailable()
    }
    async fn read_fields(&self, _key: &str) -> StoreResult<HashMap<String, String>> {
        unavailable()
    }
    async fn write_fields(&self, _: &str, _: Vec<(String, String)>, _: Duration) -> StoreResult<()> {
        unavailable()
    }
}

#[tokio::test]
async fn test_remote_failure_falls_back_to_memory() {
    let h = harness_with(
        |clock| Storage::with_primary(StorageBackend::Redis, Arc::new(FailingStore), clock),
        vec![WindowSpec::day(2)],
    );

    assert!(h.limiter.evaluate("x", true).await.admitted);
    assert!(h.limiter.evaluate("x", true).await.admitted);
    let third = h.limiter.evaluate("x", true).await;
    assert!(!third.admitted);
    assert_eq!(third.violated_window, Some(WindowName::Day));

    assert!(h.storage.fallback_count() >= 6);
    let aggregate = h.reader.get_one("x").await.unwrap();
    assert_eq!(aggregate.total_requests, 3);
    assert_eq!(aggregate.blocked_requests, 1);
}

/// Remote backend that stays readable but refuses list pushes once
/// `pushes_fail` is set.
struct PushRefusingStore {
    inner: MemoryStore,
    pushes_fail: AtomicBool,
}

#[async_trait]
impl CounterStore for PushRefusingStore {
    fn name(&self) -> &'static str {
        "push-refusing"
    }
    async fn get(&self, key: &str) -> StoreResult<u64> {
        self.inner.get(key).await
    }
    async fn increment_and_expire(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        self.inner.increment_and_expire(key, ttl).await
    }
    async fn keys_matching(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.keys_matching(prefix).await
    }
    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }
}

#[async_trait]
impl ActivityStore for PushRefusingStore {
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> StoreResult<()> {
        if self.pushes_fail.load(Ordering::SeqCst) {
            return unavailable();
        }
        self.inner.push_capped(key, value, cap, ttl).await
    }
    async fn trim(&self, key: &str, keep: usize) -> StoreResult<()> {
        self.inner.trim(key, keep).await
    }
    async fn range(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.inner.range(key, limit).await
    }
    async fn read_fields(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.read_fields(key).await
    }
    async fn write_fields(&self, key: &str, fields: Vec<(String, String)>, ttl: Duration) -> StoreResult<()> {
        self.inner.write_fields(key, fields, ttl).await
    }
}

fn encoded_entry(identifier: &str, millis: u64) -> String {
    serde_json::to_string(&LogEntry {
        identifier: identifier.to_string(),
        timestamp: iso_timestamp(millis),
        admitted: true,
        violated_window: "none".to_string(),
        user_agent: "unknown".to_string(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_cleanup_keeps_recent_remote_entries_when_pushes_fail() {
    let clock = Arc::new(ManualClock::new(START));
    let retention = Duration::from_secs(60 * 86_400);
    let remote = Arc::new(PushRefusingStore {
        inner: MemoryStore::new(clock.clone() as Arc<dyn Clock>),
        pushes_fail: AtomicBool::new(false),
    });

    remote
        .push_capped("ip_logs:r", encoded_entry("r", START), 100, retention)
        .await
        .unwrap();
    clock.advance(31 * DAY_MS);
    for i in 0..3 {
        let line = encoded_entry("r", START + 31 * DAY_MS + i);
        remote.push_capped("ip_logs:r", line, 100, retention).await.unwrap();
    }
    remote.pushes_fail.store(true, Ordering::SeqCst);

    let storage = Arc::new(Storage::with_primary(
        StorageBackend::Redis,
        remote.clone(),
        clock.clone() as Arc<dyn Clock>,
    ));
    let activity = ActivityLogger::new(storage.clone(), 100, retention);

    let removed = activity.cleanup_older_than(Duration::from_secs(30 * 86_400)).await;
    assert_eq!(removed, 1);
    assert_eq!(storage.fallback_count(), 0);

    let left = remote.inner.range("ip_logs:r", 100).await.unwrap();
    assert_eq!(left.len(), 3);
    assert_eq!(left[0], encoded_entry("r", START + 31 * DAY_MS + 2));
    assert_eq!(left[2], encoded_entry("r", START + 31 * DAY_MS));
}

#[derive(Debug)]
enum Entry {
    Text(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

/// Minimal in-memory imitation of an Upstash REST endpoint.
#[derive(Clone, Default)]
struct FakeUpstash {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

fn arg(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FakeUpstash {
    fn exec(&self, command: &[Value]) -> Value {
        let args: Vec<String> = command.iter().map(arg).collect();
        let mut data = self.data.lock().unwrap();
        let key = args.get(1).cloned().unwrap_or_default();
        let result = match args[0].to_ascii_uppercase().as_str() {
            "GET" => match data.get(&key) {
                Some(Entry::Text(s)) => json!(s),
                _ => Value::Null,
            },
            "INCR" => {
                let next = match data.get(&key) {
                    Some(Entry::Text(s)) => s.parse::<i64>().unwrap_or(0) + 1,
                    _ => 1,
                };
                data.insert(key, Entry::Text(next.to_string()));
                json!(next)
            }
            "EXPIRE" => json!(1),
            "DEL" => json!(data.remove(&key).map_or(0, |_| 1)),
            "KEYS" => {
                let prefix = key.trim_end_matches('*');
                let mut keys: Vec<&String> = data.keys().filter(|k| k.starts_with(prefix)).collect();
                keys.sort();
                json!(keys)
            }
            "LPUSH" => {
                let entry = data.entry(key).or_insert_with(|| Entry::List(VecDeque::new()));
                match entry {
                    Entry::List(list) => {
                        list.push_front(args[2].clone());
                        json!(list.len())
                    }
                    _ => return json!({"error": "WRONGTYPE"}),
                }
            }
            "LTRIM" => {
                let stop: usize = args[3].parse().unwrap();
                if let Some(Entry::List(list)) = data.get_mut(&key) {
                    list.truncate(stop + 1);
                }
                json!("OK")
            }
            "LRANGE" => {
                let stop: usize = args[3].parse().unwrap();
                match data.get(&key) {
                    Some(Entry::List(list)) => json!(list.iter().take(stop + 1).collect::<Vec<_>>()),
                    _ => json!([]),
                }
            }
            "HGETALL" => match data.get(&key) {
                Some(Entry::Hash(map)) => {
                    let flat: Vec<&String> = map.iter().flat_map(|(k, v)| [k, v]).collect();
                    json!(flat)
                }
                _ => json!([]),
            },
            "HSET" => {
                let entry = data.entry(key).or_insert_with(|| Entry::Hash(HashMap::new()));
                let Entry::Hash(map) = entry else {
                    return json!({"error": "WRONGTYPE"});
                };
                for pair in args[2..].chunks(2) {
                    map.insert(pair[0].clone(), pair[1].clone());
                }
                json!(args[2..].len() / 2)
            }
            other => return json!({ "error": format!("ERR unknown command '{}'", other) }),
        };
        json!({ "result": result })
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer secret")
}

async fn single(
    State(fake): State<FakeUpstash>,
    headers: HeaderMap,
    Json(command): Json<Vec<Value>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
    }
    (StatusCode::OK, Json(fake.exec(&command)))
}

async fn pipeline(
    State(fake): State<FakeUpstash>,
    headers: HeaderMap,
    Json(commands): Json<Vec<Vec<Value>>>,
) -> (StatusCode, Json<Value>) {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"})));
    }
    let replies: Vec<Value> = commands.iter().map(|c| fake.exec(c)).collect();
    (StatusCode::OK, Json(Value::Array(replies)))
}

async fn spawn_fake_upstash() -> String {
    let app = Router::new()
        .route("/", post(single))
        .route("/pipeline", post(pipeline))
        .with_state(FakeUpstash::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn rest_storage(url: String, token: &'static str) -> impl FnOnce(Arc<dyn Clock>) -> Storage {
    move |clock: Arc<dyn Clock>| {
        let store = RestStore::new(&url, token, Duration::from_secs(2)).unwrap();
        Storage::with_primary(StorageBackend::UpstashRest, Arc::new(store), clock)
    }
}

#[tokio::test]
async fn test_rest_backend_end_to_end() {
    let url = spawn_fake_upstash().await;
    let h = harness_with(rest_storage(url, "secret"), vec![WindowSpec::hour(2), WindowSpec::day(10)]);

    assert!(h.limiter.evaluate("9.9.9.9", true).await.admitted);
    assert!(h.limiter.evaluate("9.9.9.9", true).await.admitted);
    let third = h.limiter.evaluate("9.9.9.9", true).await;
    assert!(!third.admitted);
    assert_eq!(third.violated_window, Some(WindowName::Hour));
    assert_eq!(third.counts_by_window[&WindowName::Day], 2);

    assert_eq!(h.storage.fallback_count(), 0);
    assert_eq!(h.storage.memory_store().counter_len(), 0);

    let aggregate = h.reader.get_one("9.9.9.9").await.unwrap();
    assert_eq!(aggregate.total_requests, 3);
    assert_eq!(aggregate.blocked_requests, 1);
    assert_eq!(h.reader.get_log("9.9.9.9", 100).await.len(), 3);
    assert_eq!(h.reader.get_all().await.len(), 1);

    assert_eq!(h.limiter.reset(Some("9.9.9.9")).await, 2);
    assert!(h.limiter.evaluate("9.9.9.9", false).await.admitted);
}

#[tokio::test]
async fn test_rest_backend_rejecting_token_falls_back() {
    let url = spawn_fake_upstash().await;
    let h = harness_with(rest_storage(url, "wrong"), vec![WindowSpec::day(1)]);

    assert!(h.limiter.evaluate("c", true).await.admitted);
    assert!(!h.limiter.evaluate("c", true).await.admitted);
    assert!(h.storage.fallback_count() > 0);
    assert_eq!(h.storage.memory_store().counter_len(), 1);
}

#[tokio::test]
async fn test_rest_zero_cap_and_trim_leave_no_list() {
    let url = spawn_fake_upstash().await;
    let store = RestStore::new(&url, "secret", Duration::from_secs(2)).unwrap();
    let ttl = Duration::from_secs(60);

    store.push_capped("ip_logs:z", "a".to_string(), 5, ttl).await.unwrap();
    store.push_capped("ip_logs:z", "b".to_string(), 0, ttl).await.unwrap();
    assert!(store.range("ip_logs:z", 10).await.unwrap().is_empty());
    assert!(store.keys_matching("ip_logs:").await.unwrap().is_empty());

    for value in ["a", "b", "c"] {
        store.push_capped("ip_logs:t", value.to_string(), 5, ttl).await.unwrap();
    }
    store.trim("ip_logs:t", 2).await.unwrap();
    assert_eq!(store.range("ip_logs:t", 10).await.unwrap(), vec!["c", "b"]);
    store.trim("ip_logs:t", 0).await.unwrap();
    assert!(store.range("ip_logs:t", 10).await.unwrap().is_empty());
}
