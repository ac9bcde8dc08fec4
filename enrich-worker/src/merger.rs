use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use enrich_common::cache::CachedDocument;
use serde_json::Value;
use tracing::{debug, warn};

use crate::gate::CacheGate;
use crate::packet::{Packet, PacketEntry};
use crate::record::Verdict;
use crate::report::Report;
use crate::service::{Document, EnrichmentService};

/// Ranks two versions of the same entity: `Greater` when the first one should
/// supply the identity of the merged document.
pub type Comparator = fn(&Document, &Document) -> Ordering;

/// How documents sharing a group key are folded into one.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    prefer: Option<Comparator>,
    identity_fields: &'static [&'static str],
    concat_fields: &'static [&'static str],
}

impl MergePolicy {
    /// The first version seen wins and nothing is combined.
    pub const fn first_wins() -> Self {
        Self {
            prefer: None,
            identity_fields: &[],
            concat_fields: &[],
        }
    }

    pub const fn new(
        prefer: Comparator,
        identity_fields: &'static [&'static str],
        concat_fields: &'static [&'static str],
    ) -> Self {
        Self {
            prefer: Some(prefer),
            identity_fields,
            concat_fields,
        }
    }

    /// Fold `candidate` into `current`. List fields are concatenated, identity
    /// fields are taken from whichever version the comparator prefers.
    pub fn merge(&self, current: &mut Document, candidate: Document) {
        for field in self.concat_fields {
            let mut values = match current.remove(*field) {
                Some(Value::Array(values)) => values,
                Some(Value::Null) | None => Vec::new(),
                Some(value) => vec![value],
            };
            match candidate.get(*field) {
                Some(Value::Array(more)) => values.extend(more.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(value) => values.push(value.clone()),
            }
            current.insert((*field).to_owned(), Value::Array(values));
        }

        let Some(prefer) = self.prefer else {
            return;
        };

        if prefer(&candidate, current) == Ordering::Greater {
            for field in self.identity_fields {
                match candidate.get(*field) {
                    Some(value) => current.insert((*field).to_owned(), value.clone()),
                    None => current.remove(*field),
                };
            }
        }
    }
}

/// Query results indexed by every key they are addressable by.
#[derive(Debug, Default)]
pub struct ResultIndex {
    slots: Vec<Document>,
    keys: HashMap<String, usize>,
}

impl ResultIndex {
    pub fn build(documents: Vec<Document>, service: &dyn EnrichmentService) -> Self {
        let mut index = Self::default();
        let policy = service.merge_policy();

        for document in documents {
            let keys = service.document_keys(&document);
            let Some(group) = keys.first() else {
                debug!("{}: ignoring a result without identifier", service.name());
                continue;
            };

            let slot = match index.keys.get(group) {
                Some(&slot) => {
                    policy.merge(&mut index.slots[slot], document);
                    slot
                }
                None => {
                    index.slots.push(document);
                    index.slots.len() - 1
                }
            };

            for key in keys {
                index.keys.entry(key).or_insert(slot);
            }
        }

        index
    }

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.keys.get(key).map(|&slot| &self.slots[slot])
    }

    /// Number of distinct entities.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Applies resolved documents to the records of a packet, fills the cache and
/// completes every entry.
pub struct ResultMerger {
    service: Arc<dyn EnrichmentService>,
    gate: Arc<CacheGate>,
    report: Arc<Report>,
}

impl ResultMerger {
    pub fn new(
        service: Arc<dyn EnrichmentService>,
        gate: Arc<CacheGate>,
        report: Arc<Report>,
    ) -> Self {
        Self {
            service,
            gate,
            report,
        }
    }

    pub async fn merge(&self, packet: Packet, documents: Vec<Document>) {
        let index = ResultIndex::build(documents, self.service.as_ref());
        let mut synonyms: HashMap<String, Option<Document>> = HashMap::new();
        let mut written: HashSet<String> = HashSet::new();

        for PacketEntry { mut entry, key } in packet.into_entries() {
            let document = match index.get(&key) {
                Some(document) => Some(document.clone()),
                None => match synonyms.get(&key) {
                    Some(known) => known.clone(),
                    None => {
                        let found = self.find_synonym(&key).await;
                        synonyms.insert(key.clone(), found.clone());
                        found
                    }
                },
            };

            let Some(document) = document else {
                if written.insert(key.clone()) {
                    self.gate.store(&key, &CachedDocument::Negative).await;
                }
                entry.keep();
                continue;
            };

            let fields = self.service.mappings().apply(&document);
            entry.record.merge_fields(&fields);

            let cached = CachedDocument::Positive(fields);
            let mut keys = vec![key];
            keys.extend(self.service.document_keys(&document));
            for key in keys {
                if written.insert(key.clone()) {
                    self.gate.store(&key, &cached).await;
                }
            }

            let verdict = self.service.verdict(&mut entry.record).await;
            match verdict {
                Verdict::Keep => self.report.enriched(),
                Verdict::Discard(_) => self.report.discarded(),
            }
            entry.finish(verdict);
        }
    }

    /// Best effort: a failed synonym lookup leaves the record unenriched.
    async fn find_synonym(&self, key: &str) -> Option<Document> {
        if !self.service.has_synonyms(key) {
            return None;
        }

        self.report.synonym_query();
        match self.service.query_synonym(key).await {
            Ok(document) => document,
            Err(error) => {
                warn!("{}: synonym lookup failed for {key}: {error}", self.service.name());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use enrich_common::cache::{Cache, MockCache};
    use http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::error::QueryError;
    use crate::record::{BufferEntry, Continuation};
    use crate::test_utils::{document, record, ScriptedService};

    #[test]
    fn test_merge_policy_prefers_live_version_and_concatenates_tags() {
        let service = ScriptedService::new();
        let index = ResultIndex::build(
            vec![
                document(json!({"key": "10.1/a", "id": "v1", "status": "draft", "tags": ["x"]})),
                document(json!({"key": "10.1/a", "id": "v2", "status": "live", "tags": ["y"]})),
                document(json!({"key": "10.1/a", "id": "v3", "status": "draft", "tags": ["z"]})),
            ],
            &service,
        );

        assert_eq!(index.len(), 1);
        let merged = index.get("10.1/a").unwrap();
        assert_eq!(merged["id"], json!("v2"));
        assert_eq!(merged["tags"], json!(["x", "y", "z"]));

        // every version id points at the merged document
        for alias in ["v1", "v2", "v3"] {
            assert_eq!(index.get(alias).unwrap()["id"], json!("v2"));
        }
    }

    #[test]
    fn test_first_wins_keeps_first_version() {
        let mut current = document(json!({"id": "v1", "tags": ["x"]}));
        MergePolicy::first_wins().merge(&mut current, document(json!({"id": "v2", "tags": ["y"]})));

        assert_eq!(current, document(json!({"id": "v1", "tags": ["x"]})));
    }

    #[test]
    fn test_results_without_identifier_are_ignored() {
        let service = ScriptedService::new();
        let index = ResultIndex::build(vec![document(json!({"title": "orphan"}))], &service);

        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_failed_synonym_lookup_keeps_record_and_caches_negative() {
        let service = ScriptedService::new()
            .with_synonym("10.1/old", document(json!({"key": "10.1/new", "id": "w1"})))
            .failing_synonyms(vec![QueryError::Status(StatusCode::BAD_GATEWAY)]);
        let cache = MockCache::new();
        let shared: Arc<dyn Cache> = Arc::new(cache.clone());
        let report = Arc::new(Report::new("test"));
        let gate = Arc::new(CacheGate::new(Some(shared), report.clone()));
        let merger = ResultMerger::new(Arc::new(service.clone()), gate, report.clone());

        let (continuation, completed) = Continuation::channel();
        let mut packet = Packet::default();
        packet.push(
            BufferEntry::new(record(json!({"doi": "10.1/old"})), continuation),
            "10.1/old".to_owned(),
        );
        merger.merge(packet, Vec::new()).await;

        let completion = completed.await.unwrap();
        assert!(completion.is_keep());
        assert_eq!(completion.record().get("ext_id"), None);
        assert_eq!(service.synonym_queries(), vec!["10.1/old".to_owned()]);
        assert_eq!(report.snapshot().synonym_queries, 1);
        assert_eq!(report.snapshot().enriched, 0);
        assert_eq!(cache.stored("10.1/old"), Some(CachedDocument::Negative));
    }
}
