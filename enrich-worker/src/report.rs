//! Per-stage counters. Tests read them from a snapshot, production reads them
//! from the prometheus endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct Report {
    service: String,
    queries: AtomicU64,
    query_failures: AtomicU64,
    synonym_queries: AtomicU64,
    invalid_keys: AtomicU64,
    passthrough: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_read_failures: AtomicU64,
    cache_fails: AtomicU64,
    ignored_packets: AtomicU64,
    enriched: AtomicU64,
    discarded: AtomicU64,
    min_response_ms: AtomicI64,
    max_response_ms: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSnapshot {
    pub queries: u64,
    pub query_failures: u64,
    pub synonym_queries: u64,
    pub invalid_keys: u64,
    pub passthrough: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_read_failures: u64,
    pub cache_fails: u64,
    pub ignored_packets: u64,
    pub enriched: u64,
    pub discarded: u64,
    pub min_response_time: Option<Duration>,
    pub max_response_time: Option<Duration>,
}

macro_rules! counter_methods {
    ($($method:ident => $field:ident, $metric:literal;)*) => {
        $(
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
                metrics::counter!($metric, "service" => self.service.clone()).increment(1);
            }
        )*
    };
}

impl Report {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_owned(),
            queries: AtomicU64::new(0),
            query_failures: AtomicU64::new(0),
            synonym_queries: AtomicU64::new(0),
            invalid_keys: AtomicU64::new(0),
            passthrough: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_read_failures: AtomicU64::new(0),
            cache_fails: AtomicU64::new(0),
            ignored_packets: AtomicU64::new(0),
            enriched: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            min_response_ms: AtomicI64::new(-1),
            max_response_ms: AtomicI64::new(-1),
        }
    }

    counter_methods! {
        query => queries, "enrich_queries_total";
        query_failed => query_failures, "enrich_query_failures_total";
        synonym_query => synonym_queries, "enrich_synonym_queries_total";
        invalid_key => invalid_keys, "enrich_invalid_keys_total";
        passthrough => passthrough, "enrich_passthrough_total";
        cache_hit => cache_hits, "enrich_cache_hits_total";
        cache_miss => cache_misses, "enrich_cache_misses_total";
        cache_read_failed => cache_read_failures, "enrich_cache_read_failures_total";
        cache_write_failed => cache_fails, "enrich_cache_fails_total";
        packet_ignored => ignored_packets, "enrich_ignored_packets_total";
        enriched => enriched, "enrich_records_enriched_total";
        discarded => discarded, "enrich_records_discarded_total";
    }

    /// Track the running min/max of external round trips.
    pub fn response_time(&self, elapsed: Duration) {
        let ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);

        metrics::histogram!("enrich_query_duration_seconds", "service" => self.service.clone())
            .record(elapsed.as_secs_f64());

        let min = self.min_response_ms.load(Ordering::Relaxed);
        if min < 0 || ms < min {
            self.min_response_ms.store(ms, Ordering::Relaxed);
        }
        if ms > self.max_response_ms.load(Ordering::Relaxed) {
            self.max_response_ms.store(ms, Ordering::Relaxed);
        }
    }

    pub fn buffer_length(&self, length: usize) {
        metrics::gauge!("enrich_buffer_length", "service" => self.service.clone())
            .set(length as f64);
    }

    pub fn snapshot(&self) -> ReportSnapshot {
        let millis = |value: i64| u64::try_from(value).ok().map(Duration::from_millis);

        ReportSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            synonym_queries: self.synonym_queries.load(Ordering::Relaxed),
            invalid_keys: self.invalid_keys.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_read_failures: self.cache_read_failures.load(Ordering::Relaxed),
            cache_fails: self.cache_fails.load(Ordering::Relaxed),
            ignored_packets: self.ignored_packets.load(Ordering::Relaxed),
            enriched: self.enriched.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            min_response_time: millis(self.min_response_ms.load(Ordering::Relaxed)),
            max_response_time: millis(self.max_response_ms.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_time_tracks_min_and_max() {
        let report = Report::new("test");
        assert_eq!(report.snapshot().min_response_time, None);

        report.response_time(Duration::from_millis(120));
        report.response_time(Duration::from_millis(40));
        report.response_time(Duration::from_millis(300));

        let snapshot = report.snapshot();
        assert_eq!(snapshot.min_response_time, Some(Duration::from_millis(40)));
        assert_eq!(snapshot.max_response_time, Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_counters() {
        let report = Report::new("test");
        report.query();
        report.query();
        report.query_failed();
        report.cache_write_failed();

        let snapshot = report.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.query_failures, 1);
        assert_eq!(snapshot.cache_fails, 1);
        assert_eq!(snapshot.cache_hits, 0);
    }
}
