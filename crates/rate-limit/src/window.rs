//! Fixed time buckets for named quota windows.

use std::time::Duration;

use quotaguard_common::{WindowConfig, WindowName};

/// Index of the bucket that `now_ms` falls into.
pub fn bucket_index(now_ms: u64, duration_ms: u64) -> u64 {
    now_ms / duration_ms
}

/// First millisecond after bucket `index`.
pub fn window_end(index: u64, duration_ms: u64) -> u64 {
    index.saturating_add(1).saturating_mul(duration_ms)
}

/// An immutable quota window: at most `ceiling` admitted requests per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpec {
    pub name: WindowName,
    pub duration_ms: u64,
    pub ceiling: u64,
}

impl WindowSpec {
    pub fn new(name: WindowName, duration_ms: u64, ceiling: u64) -> Self {
        Self {
            name,
            duration_ms,
            ceiling,
        }
    }

    pub fn minute(ceiling: u64) -> Self {
        Self::named(WindowName::Minute, ceiling)
    }

    pub fn hour(ceiling: u64) -> Self {
        Self::named(WindowName::Hour, ceiling)
    }

    pub fn day(ceiling: u64) -> Self {
        Self::named(WindowName::Day, ceiling)
    }

    fn named(name: WindowName, ceiling: u64) -> Self {
        let duration_ms = name.default_duration().as_millis() as u64;
        Self::new(name, duration_ms, ceiling)
    }

    pub fn bucket(&self, now_ms: u64) -> u64 {
        bucket_index(now_ms, self.duration_ms)
    }

    pub fn reset_at(&self, now_ms: u64) -> u64 {
        window_end(self.bucket(now_ms), self.duration_ms)
    }

    /// Counter keys live exactly one window length past their last increment.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Counter key for `identifier` in the bucket containing `now_ms`.
    pub fn counter_key(&self, identifier: &str, now_ms: u64) -> String {
        format!(
            "{}{}:{}:{}",
            crate::store::COUNTER_PREFIX,
            self.name,
            identifier,
            self.bucket(now_ms)
        )
    }
}

impl From<&WindowConfig> for WindowSpec {
    fn from(config: &WindowConfig) -> Self {
        Self::new(config.name, config.duration().as_millis() as u64, config.ceiling)
    }
}
