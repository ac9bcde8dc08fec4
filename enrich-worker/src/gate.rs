use std::sync::Arc;

use enrich_common::cache::{Cache, CachedDocument};
use tracing::warn;

use crate::record::{Record, Verdict};
use crate::report::Report;
use crate::service::EnrichmentService;

/// What the cache knew about a key.
#[derive(Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// The record was resolved from the cache.
    Hit(Verdict),
    /// The key has to be queried.
    Miss,
}

/// Cache-aside access for the stage: answers lookups before a key joins a
/// packet and stores what the service returned afterwards. Cache problems
/// never fail the stage, reads degrade to misses and writes are dropped.
pub struct CacheGate {
    cache: Option<Arc<dyn Cache>>,
    report: Arc<Report>,
}

impl CacheGate {
    pub fn new(cache: Option<Arc<dyn Cache>>, report: Arc<Report>) -> Self {
        Self { cache, report }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub async fn check(
        &self,
        service: &dyn EnrichmentService,
        record: &mut Record,
        key: &str,
    ) -> GateOutcome {
        let Some(cache) = &self.cache else {
            return GateOutcome::Miss;
        };

        match cache.get(key).await {
            Ok(Some(CachedDocument::Positive(fields))) => {
                self.report.cache_hit();
                record.merge_fields(&fields);
                let verdict = service.verdict(record).await;
                match verdict {
                    Verdict::Keep => self.report.enriched(),
                    Verdict::Discard(_) => self.report.discarded(),
                }
                GateOutcome::Hit(verdict)
            }
            Ok(Some(CachedDocument::Negative)) => {
                self.report.cache_hit();
                GateOutcome::Hit(Verdict::Keep)
            }
            Ok(None) => {
                self.report.cache_miss();
                GateOutcome::Miss
            }
            Err(error) => {
                warn!("{}: cache read failed for {key}, querying instead: {error}", service.name());
                self.report.cache_read_failed();
                GateOutcome::Miss
            }
        }
    }

    pub async fn store(&self, key: &str, document: &CachedDocument) {
        let Some(cache) = &self.cache else {
            return;
        };

        if let Err(error) = cache.set(key, document).await {
            warn!("failed to cache {key}: {error}");
            self.report.cache_write_failed();
        }
    }
}
