//! Process-wide backend selection and the in-process fallback policy.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quotaguard_common::{StorageBackend, StorageConfig};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{Backend, MemoryStore, RedisStore, RestStore, StoreResult};

/// The storage chosen at startup.
///
/// Owns the in-process [`MemoryStore`] outright: it serves `memory` mode
/// directly and absorbs every failed remote operation. A remote failure is
/// never surfaced; the same operation is re-run against the in-process store,
/// so counts seen during an outage are the local ones.
pub struct Storage {
    kind: StorageBackend,
    primary: Option<Arc<dyn Backend>>,
    memory: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    fallbacks: AtomicU64,
}

impl Storage {
    /// Build the storage described by `config`.
    ///
    /// A remote backend that cannot even be constructed (bad URL, missing REST
    /// credentials) leaves the in-process store in charge.
    pub fn from_config(config: &StorageConfig, clock: Arc<dyn Clock>) -> Self {
        let primary: Option<Arc<dyn Backend>> = match config.backend {
            StorageBackend::Memory | StorageBackend::Disabled => None,
            StorageBackend::Redis => match RedisStore::open(&config.redis_url, config.timeout()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(error = %e, "invalid redis configuration, using in-process store");
                    None
                }
            },
            StorageBackend::UpstashRest => {
                let url = config.rest_url.as_deref().unwrap_or_default();
                let token = config.rest_token.as_deref().unwrap_or_default();
                match RestStore::new(url, token, config.timeout()) {
                    Ok(store) => Some(Arc::new(store)),
                    Err(e) => {
                        warn!(error = %e, "invalid REST store configuration, using in-process store");
                        None
                    }
                }
            }
        };

        info!(backend = config.backend.as_str(), remote = primary.is_some(), "storage selected");

        Self::assemble(config.backend, primary, clock)
    }

    /// Purely in-process storage.
    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        Self::assemble(StorageBackend::Memory, None, clock)
    }

    /// Storage for the inert `disabled` mode.
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::assemble(StorageBackend::Disabled, None, clock)
    }

    /// Storage with an explicit remote backend in front of the in-process one.
    pub fn with_primary(
        kind: StorageBackend,
        primary: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::assemble(kind, Some(primary), clock)
    }

    fn assemble(
        kind: StorageBackend,
        primary: Option<Arc<dyn Backend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kind,
            primary,
            memory: Arc::new(MemoryStore::new(clock.clone())),
            clock,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> StorageBackend {
        self.kind
    }

    pub fn is_disabled(&self) -> bool {
        self.kind == StorageBackend::Disabled
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn memory_store(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// How many operations have been re-run against the in-process store.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Run `op` against the active backend, re-running it once against the
    /// in-process store if the remote backend fails.
    ///
    /// An error is only returned if the in-process store fails too.
    pub async fn with_fallback<'a, T, F, Fut>(&'a self, operation: &'static str, op: F) -> StoreResult<T>
    where
        F: Fn(&'a dyn Backend) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if let Some(primary) = &self.primary {
            match op(primary.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.fallbacks.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        backend = primary.name(),
                        operation,
                        error = %e,
                        "remote store failed, using in-process store"
                    );
                }
            }
        }

        let memory: &'a dyn Backend = self.memory.as_ref();
        op(memory).await
    }
}
