pub mod external;
pub mod key;
pub mod store;

use crate::cache::external::RedisStore;
use crate::cache::store::{CacheStore, MemoryStore};
use crate::config::{CacheConfig, StoreKind};
use crate::error::Error;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Cache failures. The service logs these and falls back to storage; they
/// are never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache operation timed out")]
    Timeout,
    #[error("cache codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    rmp_serde::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    rmp_serde::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
}

/// Builds the store selected by `config`. The external store connects lazily,
/// so an unreachable server only degrades reads to storage.
pub fn build_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, Error> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new(config.max_entries))),
        StoreKind::External => {
            let url = config.redis_url.as_deref().ok_or_else(|| Error::InvalidConfig {
                message: "cache.redis_url is required for the external store".into(),
            })?;
            let store = RedisStore::open(url, &config.namespace, config.op_timeout()).map_err(
                |e| Error::InvalidConfig {
                    message: format!("cache.redis_url: {e}"),
                },
            )?;
            Ok(Arc::new(store))
        }
    }
}
