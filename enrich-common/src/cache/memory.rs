use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;

use super::{normalize_key, Cache, CacheError, CachedDocument};

/// In-process cache, for single runs where no redis is around. Entries do not
/// outlive the process.
#[derive(Clone)]
pub struct MemoryCache {
    cache: MokaCache<String, CachedDocument>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        Self { cache, ttl }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedDocument>, CacheError> {
        Ok(self.cache.get(&normalize_key(key)).await)
    }

    async fn set(&self, key: &str, document: &CachedDocument) -> Result<(), CacheError> {
        self.cache
            .insert(normalize_key(key), document.clone())
            .await;
        Ok(())
    }

    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError> {
        if ttl != self.ttl {
            tracing::warn!(
                configured = ?self.ttl,
                requested = ?ttl,
                "memory cache was built with a different ttl, keeping the configured one"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;

    #[tokio::test]
    async fn test_memory_cache_roundtrip_is_case_insensitive() {
        let cache = MemoryCache::new(100, Duration::from_secs(60));
        let mut fields = Map::new();
        fields.insert("title".to_owned(), json!("X"));

        cache
            .set("10.1/ABC", &CachedDocument::Positive(fields.clone()))
            .await
            .unwrap();
        cache.set("10.1/none", &CachedDocument::Negative).await.unwrap();

        assert_eq!(
            cache.get("10.1/abc").await.unwrap(),
            Some(CachedDocument::Positive(fields))
        );
        assert_eq!(
            cache.get("10.1/NONE").await.unwrap(),
            Some(CachedDocument::Negative)
        );
        assert_eq!(cache.get("10.1/missing").await.unwrap(), None);
    }
}
