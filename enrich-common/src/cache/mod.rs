//! Key/value cache used to short-circuit lookups against external services.
//!
//! A cached document is either a positive entry, holding the enrichment fields
//! previously resolved for a key, or a negative marker recording that the
//! service has no match for it. Both are hits: only an absent key sends the
//! caller to the network.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod mock;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::mock::{MockCache, MockCacheCall};
pub use self::redis::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] ::redis::RedisError),
    #[error("cache operation timed out")]
    Timeout,
    #[error("cache is unavailable: {0}")]
    Unavailable(String),
    #[error("corrupted cache entry: {0}")]
    Corrupted(String),
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedDocument {
    Positive(Map<String, Value>),
    Negative,
}

impl CachedDocument {
    /// Negative markers are stored as JSON `null`, positive entries as an object.
    pub fn encode(&self) -> String {
        match self {
            CachedDocument::Positive(fields) => Value::Object(fields.clone()).to_string(),
            CachedDocument::Negative => Value::Null.to_string(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, CacheError> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Null) => Ok(CachedDocument::Negative),
            Ok(Value::Object(fields)) => Ok(CachedDocument::Positive(fields)),
            Ok(other) => Err(CacheError::Corrupted(format!(
                "expected an object or null, got {other}"
            ))),
            Err(e) => Err(CacheError::Corrupted(e.to_string())),
        }
    }
}

/// Keys are compared case-insensitively by every cache implementation.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedDocument>, CacheError>;

    async fn set(&self, key: &str, document: &CachedDocument) -> Result<(), CacheError>;

    /// Prepare the backend for entries living `ttl`. Failing here means the cache
    /// cannot be used at all.
    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError>;
}
