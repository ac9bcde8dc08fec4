use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::gate::{CacheGate, GateOutcome};
use crate::record::BufferEntry;
use crate::report::Report;
use crate::service::{EnrichmentService, LookupKey};

/// FIFO of records waiting to be enriched.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    entries: VecDeque<BufferEntry>,
}

impl RecordBuffer {
    pub fn push(&mut self, entry: BufferEntry) {
        self.entries.push_back(entry)
    }

    pub fn pop(&mut self) -> Option<BufferEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every waiting entry, oldest first.
    pub fn take_all(&mut self) -> Vec<BufferEntry> {
        self.entries.drain(..).collect()
    }
}

#[derive(Debug)]
pub struct PacketEntry {
    pub entry: BufferEntry,
    pub key: String,
}

/// Records missing from the cache, resolved together with a single query.
#[derive(Debug, Default)]
pub struct Packet {
    entries: Vec<PacketEntry>,
    keys: Vec<String>,
    seen: HashSet<String>,
}

impl Packet {
    pub fn push(&mut self, entry: BufferEntry, key: String) {
        if self.seen.insert(key.clone()) {
            self.keys.push(key.clone());
        }
        self.entries.push(PacketEntry { entry, key });
    }

    /// Distinct keys, in the order they were first seen.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<PacketEntry> {
        self.entries
    }

    /// Complete every record unenriched.
    pub fn pass_through(self) {
        for PacketEntry { entry, .. } in self.entries {
            entry.keep();
        }
    }

    pub fn abort(self) {
        for PacketEntry { entry, .. } in self.entries {
            entry.abort();
        }
    }
}

/// Pulls records off the buffer and groups the ones needing a query.
///
/// Records without a usable key and records the cache can answer are completed
/// on the spot; only cache misses end up in the packet.
pub struct PacketAssembler {
    service: Arc<dyn EnrichmentService>,
    gate: Arc<CacheGate>,
    packet_size: usize,
    report: Arc<Report>,
}

impl PacketAssembler {
    pub fn new(
        service: Arc<dyn EnrichmentService>,
        gate: Arc<CacheGate>,
        packet_size: usize,
        report: Arc<Report>,
    ) -> Self {
        Self {
            service,
            gate,
            packet_size,
            report,
        }
    }

    /// Build the next packet from entries handed out by `pop`. Stops once the
    /// packet holds `packet_size` distinct keys or `pop` runs dry.
    pub async fn assemble<F>(&self, mut pop: F) -> Packet
    where
        F: FnMut() -> Option<BufferEntry> + Send,
    {
        let mut packet = Packet::default();

        while packet.keys().len() < self.packet_size {
            let Some(mut entry) = pop() else {
                break;
            };

            let key = match self.service.lookup_key(&mut entry.record) {
                LookupKey::Key(key) => key,
                LookupKey::Missing => {
                    self.report.passthrough();
                    entry.keep();
                    continue;
                }
                LookupKey::Invalid(raw) => {
                    debug!("{}: {raw:?} is not a valid identifier", self.service.name());
                    self.report.invalid_key();
                    entry.keep();
                    continue;
                }
            };

            match self
                .gate
                .check(self.service.as_ref(), &mut entry.record, &key)
                .await
            {
                GateOutcome::Hit(verdict) => entry.finish(verdict),
                GateOutcome::Miss => packet.push(entry, key),
            }
        }

        packet
    }
}

#[cfg(test)]
mod tests {
    use enrich_common::cache::{CachedDocument, MockCache};
    use serde_json::json;

    use super::*;
    use crate::record::{Completion, Continuation};
    use crate::test_utils::{document, record, ScriptedService};

    fn assembler(packet_size: usize, cache: Option<MockCache>) -> (PacketAssembler, Arc<Report>) {
        let report = Arc::new(Report::new("test"));
        let cache = cache.map(|cache| -> Arc<dyn enrich_common::cache::Cache> { Arc::new(cache) });
        let gate = Arc::new(CacheGate::new(cache, report.clone()));
        let assembler = PacketAssembler::new(
            Arc::new(ScriptedService::new()),
            gate,
            packet_size,
            report.clone(),
        );
        (assembler, report)
    }

    fn buffer(
        records: Vec<serde_json::Value>,
    ) -> (RecordBuffer, Vec<tokio::sync::oneshot::Receiver<Completion>>) {
        let mut buffer = RecordBuffer::default();
        let mut receivers = Vec::new();
        for value in records {
            let (continuation, rx) = Continuation::channel();
            buffer.push(BufferEntry::new(record(value), continuation));
            receivers.push(rx);
        }
        (buffer, receivers)
    }

    #[tokio::test]
    async fn test_packet_size_counts_distinct_keys() {
        let (assembler, _) = assembler(2, None);
        let (mut buffer, _receivers) = buffer(vec![
            json!({"doi": "10.1/a"}),
            json!({"doi": "10.1/A"}),
            json!({"doi": "10.1/b"}),
            json!({"doi": "10.1/c"}),
        ]);

        let packet = assembler.assemble(|| buffer.pop()).await;

        assert_eq!(packet.keys(), ["10.1/a", "10.1/b"]);
        assert_eq!(packet.len(), 3);
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_records_without_key_pass_through() {
        let (assembler, report) = assembler(10, None);
        let (mut buffer, mut receivers) = buffer(vec![
            json!({"title": "no key"}),
            json!({"doi": "not-a-doi"}),
        ]);

        let packet = assembler.assemble(|| buffer.pop()).await;

        assert!(packet.is_empty());
        for rx in receivers.iter_mut() {
            assert!(rx.await.unwrap().is_keep());
        }
        assert_eq!(report.snapshot().passthrough, 1);
        assert_eq!(report.snapshot().invalid_keys, 1);
    }

    #[tokio::test]
    async fn test_cache_hits_never_join_the_packet() {
        let cache = MockCache::new()
            .with_document("10.1/a", CachedDocument::Positive(document(json!({"title": "A"}))));
        let (assembler, report) = assembler(10, Some(cache));
        let (mut buffer, mut receivers) =
            buffer(vec![json!({"doi": "10.1/a"}), json!({"doi": "10.1/b"})]);

        let packet = assembler.assemble(|| buffer.pop()).await;

        assert_eq!(packet.keys(), ["10.1/b"]);
        let completion = (&mut receivers[0]).await.unwrap();
        assert_eq!(completion.record().get("title"), Some(&json!("A")));
        assert_eq!(report.snapshot().cache_hits, 1);
        assert_eq!(report.snapshot().cache_misses, 1);
    }
}
