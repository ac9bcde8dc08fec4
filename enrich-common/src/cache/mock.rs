use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{normalize_key, Cache, CacheError, CachedDocument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCacheCall {
    Get(String),
    Set(String),
    EnsureIndexes(Duration),
}

/// A scripted cache recording every call made to it.
#[derive(Clone, Default)]
pub struct MockCache {
    documents: Arc<Mutex<HashMap<String, CachedDocument>>>,
    calls: Arc<Mutex<Vec<MockCacheCall>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    unavailable: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, key: &str, document: CachedDocument) -> Self {
        lock(&self.documents).insert(normalize_key(key), document);
        self
    }

    pub fn failing_reads(self) -> Self {
        self.fail_reads.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_writes(self) -> Self {
        self.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub fn unavailable(self) -> Self {
        self.unavailable.store(true, Ordering::SeqCst);
        self
    }

    pub fn stored(&self, key: &str) -> Option<CachedDocument> {
        lock(&self.documents).get(&normalize_key(key)).cloned()
    }

    pub fn calls(&self) -> Vec<MockCacheCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Cache for MockCache {
    async fn get(&self, key: &str) -> Result<Option<CachedDocument>, CacheError> {
        let key = normalize_key(key);
        lock(&self.calls).push(MockCacheCall::Get(key.clone()));

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout);
        }
        Ok(lock(&self.documents).get(&key).cloned())
    }

    async fn set(&self, key: &str, document: &CachedDocument) -> Result<(), CacheError> {
        let key = normalize_key(key);
        lock(&self.calls).push(MockCacheCall::Set(key.clone()));

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Timeout);
        }
        lock(&self.documents).insert(key, document.clone());
        Ok(())
    }

    async fn ensure_indexes(&self, ttl: Duration) -> Result<(), CacheError> {
        lock(&self.calls).push(MockCacheCall::EnsureIndexes(ttl));

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("mock cache is down".to_owned()));
        }
        Ok(())
    }
}
