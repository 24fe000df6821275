use crate::cache::CacheError;
use crate::cache::store::CacheStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;

const SCAN_BATCH: usize = 500;

/// Store backed by a Redis-compatible server. Every command is bounded by
/// `op_timeout`; `clear` only removes keys under this store's namespace.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
    namespace: String,
    op_timeout: Duration,
}

impl RedisStore {
    /// Validates `url` without connecting; the connection is opened on first use.
    pub fn open(url: &str, namespace: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            namespace: namespace.to_string(),
            op_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CacheError::Unavailable(e.to_string())),
            Err(_) => Err(CacheError::Timeout),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let conn = self
            .bounded(
                self.connection
                    .get_or_try_init(|| self.client.get_multiplexed_async_connection()),
            )
            .await?;
        Ok(conn.clone())
    }

    async fn delete_matching(&self, pattern: String) -> Result<u64, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(scan_delete(&mut conn, &pattern)).await
    }
}

/// Deletes every key matching `pattern`, one SCAN batch at a time.
async fn scan_delete(conn: &mut MultiplexedConnection, pattern: &str) -> redis::RedisResult<u64> {
    let mut cursor: u64 = 0;
    let mut removed: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(conn)
            .await?;
        if !keys.is_empty() {
            let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(conn).await?;
            removed += deleted;
        }
        if next == 0 {
            return Ok(removed);
        }
        cursor = next;
    }
}

/// Escapes glob metacharacters so a literal prefix matches only itself.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn),
        )
        .await
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError> {
        match pattern.strip_suffix('*') {
            Some(prefix) => self.delete_matching(format!("{}*", escape_glob(prefix))).await,
            None => {
                let mut conn = self.connection().await?;
                self.bounded(redis::cmd("DEL").arg(pattern).query_async(&mut conn))
                    .await
            }
        }
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let pattern = format!("{}:*", escape_glob(&self.namespace));
        self.delete_matching(pattern).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::{RedisStore, escape_glob};
    use crate::cache::CacheError;
    use crate::cache::store::CacheStore;
    use std::time::Duration;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("Cache:k:list:"), "Cache:k:list:");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[tokio::test]
    async fn unreachable_server_degrades_to_an_error() {
        // Nothing listens on the discard port.
        let store = RedisStore::open("redis://127.0.0.1:9/", "Cache", Duration::from_millis(200))
            .expect("url parses");
        let err = store.get("Cache:k:id:i:1").await.expect_err("no server");
        assert!(matches!(err, CacheError::Unavailable(_) | CacheError::Timeout));
    }
}
