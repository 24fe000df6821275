use crate::cache::CacheError;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Byte-oriented key/value cache with TTLs and prefix invalidation.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Removes `pattern` exactly, or every key starting with it when it ends
    /// in `*`. Returns the number of keys removed.
    async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local store bounded by entry count; least recently used entries
/// are evicted first.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock();
        let Some(prefix) = pattern.strip_suffix('*') else {
            return Ok(u64::from(entries.pop(pattern).is_some()));
        };
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}
