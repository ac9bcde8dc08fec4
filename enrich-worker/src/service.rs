use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::mapping::FieldMappings;
use crate::merger::MergePolicy;
use crate::record::{Record, Verdict};

/// One result returned by an external service.
pub type Document = Map<String, Value>;

/// The key a record is looked up by, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKey {
    /// A normalized key to resolve.
    Key(String),
    /// The record carries nothing to look up.
    Missing,
    /// The record carries a key the service would reject.
    Invalid(String),
}

/// A bibliographic service records can be enriched from.
///
/// The stage owns buffering, caching, batching, retries and merging; a service
/// only describes how its keys, queries and documents look.
#[async_trait]
pub trait EnrichmentService: Send + Sync {
    /// Used in logs, metric labels and cache prefixes.
    fn name(&self) -> &str;

    /// Upper bound on distinct keys per batched query.
    fn max_packet_size(&self) -> usize;

    fn mappings(&self) -> &FieldMappings;

    fn merge_policy(&self) -> &MergePolicy;

    /// Normalize the record for this service and extract its lookup key.
    fn lookup_key(&self, record: &mut Record) -> LookupKey;

    /// Normalized keys `document` is addressable by. The first one identifies the
    /// logical entity: documents sharing it are versions of each other.
    fn document_keys(&self, document: &Document) -> Vec<String>;

    /// Query all `keys` at once, asking for up to `rows` documents.
    async fn query(&self, keys: &[String], rows: usize) -> Result<Vec<Document>, QueryError>;

    /// Whether `query_synonym` can find a document the batch query missed
    /// for `key`.
    fn has_synonyms(&self, _key: &str) -> bool {
        false
    }

    /// Find the document `key` was merged into upstream.
    async fn query_synonym(&self, _key: &str) -> Result<Option<Document>, QueryError> {
        Ok(None)
    }

    /// Decide whether an enriched record is kept, filling any derived fields.
    async fn verdict(&self, _record: &mut Record) -> Verdict {
        Verdict::Keep
    }
}
