//! Multi-window request quotas with per-identifier activity analytics.
//!
//! A [`RateLimiter`] admits or rejects a request for an identifier (usually
//! a client IP) against several fixed-bucket windows at once, e.g. one per
//! minute, twenty per hour and fifty per day. Counters, the bounded request
//! log and the running aggregate all live behind the [`store`] traits:
//!
//! - [`MemoryStore`] -- in-process [`DashMap`](dashmap::DashMap)s, also the
//!   fallback for every remote failure.
//! - [`RedisStore`] -- Redis protocol via a multiplexed connection manager.
//! - [`RestStore`] -- Redis-compatible HTTPS REST endpoints.
//!
//! [`Storage`] picks one at startup and applies the fallback policy, so
//! nothing in this crate surfaces a storage error to the caller. The worst
//! outcome of a double failure is an admitted, unrecorded request.

pub mod activity;
pub mod analytics;
pub mod clock;
pub mod limiter;
pub mod storage;
pub mod store;
pub mod window;

pub use activity::{ActivityLogger, AnalyticsAggregate, LogEntry};
pub use analytics::{AnalyticsReader, AnalyticsSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{RateLimitDecision, RateLimiter};
pub use storage::Storage;
pub use store::{Backend, MemoryStore, RedisStore, RestStore, StoreError, StoreResult};
pub use window::WindowSpec;
