use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;

use super::{normalize_key, Cache, CacheError, CachedDocument};

// Upper bound on every redis round trip.
const REDIS_TIMEOUT_MILLISECS: u64 = 500;

/// Redis-backed cache. Entries are namespaced by `prefix` and expire after the
/// TTL given to `ensure_indexes`.
pub struct RedisCache {
    client: redis::Client,
    prefix: String,
    ttl_secs: AtomicU64,
}

impl RedisCache {
    pub fn new(addr: &str, prefix: &str) -> Result<RedisCache, CacheError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisCache {
            client,
            prefix: prefix.to_owned(),
            ttl_secs: AtomicU64::new(0),
        })
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, normalize_key(key))
    }

    async fn connection(&self) -> Result<redis::aio::Connection, CacheError> {
        timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            self.client.get_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout)?
        .map_err(CacheError::from)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CachedDocument>, CacheError> {
        let mut conn = self.connection().await?;

        let raw: Option<String> = timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            conn.get(self.cache_key(key)),
        )
        .await
        .map_err(|_| CacheError::Timeout)??;

        raw.map(|value| CachedDocument::decode(&value)).transpose()
    }

    async fn set(&self, key: &str, document: &CachedDocument) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let cache_key = self.cache_key(key);
        let ttl = self.ttl_secs.load(Ordering::Relaxed);

        let write = async {
            if ttl == 0 {
                conn.set::<_, _, ()>(cache_key, document.encode()).await
            } else {
                conn.set_ex::<_, _, ()>(cache_key, document.encode(), ttl as usize)
                    .await
            }
        };

        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), write)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }

    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError> {
        self.ttl_secs.store(ttl.as_secs(), Ordering::Relaxed);

        let mut conn = self
            .connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        tracing::debug!(
            prefix = %self.prefix,
            %pong,
            ttl_secs = ttl.as_secs(),
            "redis cache ready"
        );

        Ok(())
    }
}
