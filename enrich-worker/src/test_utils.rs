use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use enrich_common::cache::normalize_key;
use enrich_common::retry::RetryPolicy;
use http::StatusCode;
use serde_json::Value;

use crate::error::{PipelineError, QueryError};
use crate::mapping::{joined_values, text, FieldMapping, FieldMappings};
use crate::merger::MergePolicy;
use crate::record::{Completion, Continuation, DiscardReason, Record, Verdict};
use crate::resolver::{OnFailPolicy, ResolverSettings};
use crate::service::{Document, EnrichmentService, LookupKey};
use crate::stage::{JobController, Scheduler, StageSettings};

pub fn document(value: Value) -> Document {
    match value {
        Value::Object(fields) => fields,
        other => panic!("not an object: {other}"),
    }
}

pub fn record(value: Value) -> Record {
    Record::from(document(value))
}

/// Settings for tests: no throttle, short backoff, nothing cached for long.
pub fn settings() -> StageSettings {
    StageSettings {
        enabled: true,
        cache_ttl: Duration::from_secs(60),
        packet_size: 100,
        watermark: 1000,
        resolver: ResolverSettings {
            throttle: Duration::ZERO,
            max_attempts: 3,
            retry_policy: RetryPolicy::new(
                2,
                Duration::from_millis(10),
                Some(Duration::from_millis(100)),
            ),
            on_fail: OnFailPolicy::Abort,
            retry_ceiling: Duration::from_secs(5),
            rate_limit_margin: Duration::from_millis(250),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn prefer_live(candidate: &Document, current: &Document) -> Ordering {
    let live = |document: &Document| document.get("status") == Some(&Value::from("live"));
    live(candidate).cmp(&live(current))
}

#[derive(Default)]
struct Script {
    catalog: Vec<Document>,
    failures: VecDeque<QueryError>,
    synonyms: HashMap<String, Document>,
    synonym_failures: VecDeque<QueryError>,
    queries: Vec<Vec<String>>,
    query_instants: Vec<tokio::time::Instant>,
    rows: Vec<usize>,
    synonym_queries: Vec<String>,
}

/// An in-memory service answering from a catalog of documents, with scripted
/// failures served before any answer.
///
/// Records are looked up by `doi`; documents are addressable by `key` (their
/// group) and `id` (their version). A record with `redirected: true` is
/// discarded.
#[derive(Clone)]
pub struct ScriptedService {
    script: Arc<Mutex<Script>>,
    mappings: FieldMappings,
    policy: MergePolicy,
    max_packet_size: usize,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedService {
    pub fn new() -> Self {
        let mappings = FieldMappings::new(vec![
            FieldMapping::new("title", "title", |doc| text(doc, "title")),
            FieldMapping::new("id", "ext_id", |doc| text(doc, "id")),
            FieldMapping::new("tags", "ext_tags", |doc| joined_values(doc, "tags", ",")),
            FieldMapping::new("redirected", "redirected", |doc| doc.get("redirected").cloned()),
        ])
        .expect("test mappings are valid");

        Self {
            script: Arc::new(Mutex::new(Script::default())),
            mappings,
            policy: MergePolicy::new(prefer_live, &["id", "status"], &["tags"]),
            max_packet_size: 100,
            latency: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_documents(self, documents: Vec<Document>) -> Self {
        lock(&self.script).catalog.extend(documents);
        self
    }

    pub fn with_synonym(self, key: &str, document: Document) -> Self {
        lock(&self.script).synonyms.insert(normalize_key(key), document);
        self
    }

    /// Fail the next synonym lookups with `failures`, in order.
    pub fn failing_synonyms(self, failures: Vec<QueryError>) -> Self {
        lock(&self.script).synonym_failures.extend(failures);
        self
    }

    /// Serve `failures` in order before answering again.
    pub fn failing(self, failures: Vec<QueryError>) -> Self {
        lock(&self.script).failures.extend(failures);
        self
    }

    pub fn failing_times(self, times: usize) -> Self {
        let failures = (0..times)
            .map(|_| QueryError::Status(StatusCode::SERVICE_UNAVAILABLE))
            .collect();
        self.failing(failures)
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Keys of every batched query, in order.
    pub fn queries(&self) -> Vec<Vec<String>> {
        lock(&self.script).queries.clone()
    }

    /// When each batched query reached the service.
    pub fn query_instants(&self) -> Vec<tokio::time::Instant> {
        lock(&self.script).query_instants.clone()
    }

    pub fn rows(&self) -> Vec<usize> {
        lock(&self.script).rows.clone()
    }

    pub fn synonym_queries(&self) -> Vec<String> {
        lock(&self.script).synonym_queries.clone()
    }

    /// Highest number of queries that ran at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(AtomicOrdering::SeqCst)
    }

    fn keys_of(document: &Document) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(key) = document.get("key").and_then(Value::as_str) {
            keys.push(normalize_key(key));
        }
        if let Some(id) = document.get("id").and_then(Value::as_str) {
            keys.push(normalize_key(id));
        }
        keys
    }
}

#[async_trait]
impl EnrichmentService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn mappings(&self) -> &FieldMappings {
        &self.mappings
    }

    fn merge_policy(&self) -> &MergePolicy {
        &self.policy
    }

    fn lookup_key(&self, record: &mut Record) -> LookupKey {
        match record.get_str("doi") {
            None => LookupKey::Missing,
            Some(doi) if !doi.contains('/') => LookupKey::Invalid(doi),
            Some(doi) => LookupKey::Key(normalize_key(&doi)),
        }
    }

    fn document_keys(&self, document: &Document) -> Vec<String> {
        match document.get("key") {
            Some(_) => Self::keys_of(document),
            None => Vec::new(),
        }
    }

    async fn query(&self, keys: &[String], rows: usize) -> Result<Vec<Document>, QueryError> {
        let running = self.in_flight.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, AtomicOrdering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = {
            let mut script = lock(&self.script);
            script.queries.push(keys.to_vec());
            script.query_instants.push(tokio::time::Instant::now());
            script.rows.push(rows);

            match script.failures.pop_front() {
                Some(failure) => Err(failure),
                None => Ok(script
                    .catalog
                    .iter()
                    .filter(|document| Self::keys_of(document).iter().any(|key| keys.contains(key)))
                    .cloned()
                    .collect()),
            }
        };

        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
        result
    }

    fn has_synonyms(&self, _key: &str) -> bool {
        true
    }

    async fn query_synonym(&self, key: &str) -> Result<Option<Document>, QueryError> {
        let mut script = lock(&self.script);
        script.synonym_queries.push(key.to_owned());
        match script.synonym_failures.pop_front() {
            Some(failure) => Err(failure),
            None => Ok(script.synonyms.get(key).cloned()),
        }
    }

    async fn verdict(&self, record: &mut Record) -> Verdict {
        match record.get("redirected") {
            Some(Value::Bool(true)) => Verdict::Discard(DiscardReason::Redirection),
            _ => Verdict::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Saturate,
    Drain,
}

/// Records every flow control call made by the stage.
#[derive(Default)]
pub struct RecordingScheduler {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingScheduler {
    pub fn events(&self) -> Vec<SchedulerEvent> {
        lock(&self.events).clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn saturate(&self) {
        lock(&self.events).push(SchedulerEvent::Saturate);
    }

    fn drain(&self) {
        lock(&self.events).push(SchedulerEvent::Drain);
    }
}

/// Keeps the errors the stage stopped with.
#[derive(Default)]
pub struct RecordingJob {
    errors: Mutex<Vec<String>>,
}

impl RecordingJob {
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }
}

impl JobController for RecordingJob {
    fn stop(&self, error: &PipelineError) {
        lock(&self.errors).push(error.to_string());
    }
}

/// Collects completions in the order they arrive.
#[derive(Clone, Default)]
pub struct Completions {
    completions: Arc<Mutex<Vec<Completion>>>,
}

impl Completions {
    pub fn continuation(&self) -> Continuation<Completion> {
        let completions = self.completions.clone();
        Continuation::new(move |completion| lock(&completions).push(completion))
    }

    pub fn all(&self) -> Vec<Completion> {
        lock(&self.completions).clone()
    }

    /// The value of `field` on every completed record, in completion order.
    pub fn field(&self, field: &str) -> Vec<Option<Value>> {
        self.all()
            .iter()
            .map(|completion| completion.record().get(field).cloned())
            .collect()
    }
}

/// Fields of a record, for comparisons against json literals.
pub fn fields(record: &Record) -> Value {
    Value::Object(record.fields().clone())
}
