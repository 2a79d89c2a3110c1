use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{QuotaError, QuotaResult};

/// Top-level quotaguard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

/// Which counter store backs the limiter and the activity log.
///
/// Parsing is lenient: any unrecognized name selects [`StorageBackend::Redis`],
/// which itself degrades to the in-process store when unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StorageBackend {
    Memory,
    Redis,
    UpstashRest,
    Disabled,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Redis => "redis",
            StorageBackend::UpstashRest => "upstash-rest",
            StorageBackend::Disabled => "disabled",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "disabled" => StorageBackend::Disabled,
            "upstash-rest" | "upstash_rest" | "rest" => StorageBackend::UpstashRest,
            "redis" => StorageBackend::Redis,
            other => {
                tracing::warn!(value = other, "unknown storage backend, defaulting to redis");
                StorageBackend::Redis
            }
        }
    }
}

impl From<String> for StorageBackend {
    fn from(value: String) -> Self {
        StorageBackend::from_name(&value)
    }
}

impl From<StorageBackend> for String {
    fn from(value: StorageBackend) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub rest_token: Option<String>,
    /// Upper bound for a single remote command, connection setup included.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            rest_url: None,
            rest_token: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Named quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowName {
    Minute,
    Hour,
    Day,
}

impl WindowName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowName::Minute => "minute",
            WindowName::Hour => "hour",
            WindowName::Day => "day",
        }
    }

    pub fn default_duration(&self) -> Duration {
        match self {
            WindowName::Minute => Duration::from_secs(60),
            WindowName::Hour => Duration::from_secs(60 * 60),
            WindowName::Day => Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "minute" => Some(WindowName::Minute),
            "hour" => Some(WindowName::Hour),
            "day" => Some(WindowName::Day),
            _ => None,
        }
    }
}

impl std::fmt::Display for WindowName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub name: WindowName,
    pub ceiling: u64,
    /// Overrides the window's natural length (60s / 1h / 1d).
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

impl WindowConfig {
    pub fn new(name: WindowName, ceiling: u64) -> Self {
        Self {
            name,
            ceiling,
            duration_secs: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.name.default_duration())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Evaluated in order; the first violated window rejects the request.
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,
    #[serde(default = "default_log_depth")]
    pub log_depth: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl QuotaConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            log_depth: default_log_depth(),
            retention_days: default_retention_days(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_backend() -> StorageBackend {
    StorageBackend::Redis
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_windows() -> Vec<WindowConfig> {
    vec![WindowConfig::new(WindowName::Day, 5)]
}
fn default_log_depth() -> usize {
    100
}
fn default_retention_days() -> u64 {
    30
}
fn default_maintenance_interval() -> u64 {
    60 * 60
}

/// Parse a compact window list such as `minute=1,hour=20,day=50`.
pub fn parse_windows(spec: &str) -> QuotaResult<Vec<WindowConfig>> {
    let mut windows = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, ceiling) = part
            .split_once('=')
            .ok_or_else(|| QuotaError::Config(format!("expected name=ceiling, got '{}'", part)))?;
        let name = WindowName::parse(name)
            .ok_or_else(|| QuotaError::Config(format!("unknown window '{}'", name.trim())))?;
        let ceiling = ceiling
            .trim()
            .parse::<u64>()
            .map_err(|e| QuotaError::Config(format!("invalid ceiling in '{}': {}", part, e)))?;
        windows.push(WindowConfig::new(name, ceiling));
    }
    if windows.is_empty() {
        return Err(QuotaError::Config("window list is empty".to_string()));
    }
    Ok(windows)
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> QuotaResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> QuotaResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// Recognized: `STORAGE_TYPE`, `REDIS_URL`, `UPSTASH_REDIS_REST_URL`,
    /// `UPSTASH_REDIS_REST_TOKEN`, `QUOTA_WINDOWS`. A malformed
    /// `QUOTA_WINDOWS` is ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(kind) = lookup("STORAGE_TYPE") {
            self.storage.backend = StorageBackend::from_name(&kind);
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.storage.redis_url = url;
        }
        if let Some(url) = lookup("UPSTASH_REDIS_REST_URL") {
            self.storage.rest_url = Some(url);
        }
        if let Some(token) = lookup("UPSTASH_REDIS_REST_TOKEN") {
            self.storage.rest_token = Some(token);
        }
        if let Some(spec) = lookup("QUOTA_WINDOWS") {
            match parse_windows(&spec) {
                Ok(windows) => self.quota.windows = windows,
                Err(e) => tracing::warn!(error = %e, "ignoring QUOTA_WINDOWS"),
            }
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> QuotaResult<()> {
        if self.quota.windows.is_empty() {
            return Err(QuotaError::Config(
                "quota.windows must have at least one window".to_string(),
            ));
        }

        for (i, window) in self.quota.windows.iter().enumerate() {
            if window.duration().as_millis() == 0 {
                return Err(QuotaError::Config(format!(
                    "window '{}' has a zero duration",
                    window.name
                )));
            }
            if self.quota.windows[..i].iter().any(|w| w.name == window.name) {
                return Err(QuotaError::Config(format!(
                    "window '{}' is configured twice",
                    window.name
                )));
            }
        }

        if self.quota.log_depth == 0 {
            return Err(QuotaError::Config("quota.log_depth must be positive".to_string()));
        }

        Ok(())
    }
}
