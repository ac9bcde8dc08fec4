//! The enrichment stage: buffers records, drains them through the cache gate,
//! the batch resolver and the merger, and pushes back on the upstream source
//! while the buffer is over its watermark.
//!
//! State transitions happen under a short synchronous lock that is never held
//! across an await. Draining is serialized by an async lock on the worker, so
//! at most one batched query is in flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use enrich_common::cache::Cache;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, SetupError};
use crate::gate::CacheGate;
use crate::merger::ResultMerger;
use crate::packet::{Packet, PacketAssembler, RecordBuffer};
use crate::record::{BufferEntry, Completion, Continuation, Record, StreamEnd};
use crate::report::Report;
use crate::resolver::{BatchResolver, Resolution, ResolverSettings};
use crate::service::EnrichmentService;

/// Flow control of the upstream record source.
pub trait Scheduler: Send + Sync {
    /// Stop feeding records.
    fn saturate(&self);
    /// Resume feeding records.
    fn drain(&self);
}

/// The job the stage runs in.
pub trait JobController: Send + Sync {
    /// Called once when the stage stops on a fatal error.
    fn stop(&self, error: &PipelineError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Filling,
    Draining,
    Finalizing,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct StageSettings {
    /// When false every record passes through untouched.
    pub enabled: bool,
    /// Time to live of cached documents, ignored without a cache.
    pub cache_ttl: Duration,
    /// Distinct keys per batched query, capped by the service.
    pub packet_size: usize,
    /// Buffer length above which the upstream source is paused.
    pub watermark: usize,
    pub resolver: ResolverSettings,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl: Duration::from_secs(7 * 24 * 3600),
            packet_size: 100,
            watermark: 1000,
            resolver: ResolverSettings::default(),
        }
    }
}

struct Worker {
    assembler: PacketAssembler,
    resolver: BatchResolver,
    merger: ResultMerger,
}

struct Shared {
    buffer: RecordBuffer,
    phase: Phase,
    /// The scheduler was told to pause and awaits a resume.
    saturated: bool,
    /// Every end of input signal received so far, completed together.
    ends: Vec<Continuation<StreamEnd>>,
    /// How the stream ended, once the stage stopped.
    outcome: Option<StreamEnd>,
}

struct Inner {
    enabled: bool,
    watermark: usize,
    service_name: String,
    shared: Mutex<Shared>,
    worker: tokio::sync::Mutex<Worker>,
    scheduler: Arc<dyn Scheduler>,
    job: Arc<dyn JobController>,
    report: Arc<Report>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn pop(&self) -> Option<BufferEntry> {
        let mut shared = self.lock();
        let entry = shared.buffer.pop();
        self.report.buffer_length(shared.buffer.len());
        entry
    }
}

/// Handle on an enrichment stage. Clones share the same stage.
#[derive(Clone)]
pub struct EnrichmentStage {
    inner: Arc<Inner>,
}

impl EnrichmentStage {
    /// Build a stage around `service`. With a cache, its indexes are ensured
    /// first and an unreachable cache fails the setup.
    pub async fn build(
        settings: StageSettings,
        service: Arc<dyn EnrichmentService>,
        cache: Option<Arc<dyn Cache>>,
        scheduler: Arc<dyn Scheduler>,
        job: Arc<dyn JobController>,
    ) -> Result<Self, SetupError> {
        let name = service.name().to_owned();

        if settings.enabled {
            if let Some(cache) = &cache {
                cache
                    .ensure_indexes(settings.cache_ttl)
                    .await
                    .map_err(|error| SetupError::CacheUnavailable {
                        service: name.clone(),
                        error,
                    })?;
            }
        }

        let packet_size = settings.packet_size.clamp(1, service.max_packet_size().max(1));
        if packet_size != settings.packet_size {
            info!("{name}: packet size capped to {packet_size}");
        }

        let report = Arc::new(Report::new(&name));
        let gate = Arc::new(CacheGate::new(cache, report.clone()));
        let worker = Worker {
            assembler: PacketAssembler::new(
                service.clone(),
                gate.clone(),
                packet_size,
                report.clone(),
            ),
            resolver: BatchResolver::new(service.clone(), settings.resolver, report.clone()),
            merger: ResultMerger::new(service, gate, report.clone()),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                enabled: settings.enabled,
                watermark: settings.watermark,
                service_name: name,
                shared: Mutex::new(Shared {
                    buffer: RecordBuffer::default(),
                    phase: Phase::Idle,
                    saturated: false,
                    ends: Vec::new(),
                    outcome: None,
                }),
                worker: tokio::sync::Mutex::new(worker),
                scheduler,
                job,
                report,
            }),
        })
    }

    /// Accept a record. `continuation` is invoked exactly once, possibly before
    /// this returns. Must be called from within a tokio runtime.
    pub fn enqueue(&self, record: Record, continuation: Continuation<Completion>) {
        let entry = BufferEntry::new(record, continuation);

        if !self.inner.enabled {
            entry.keep();
            return;
        }

        let mut shared = self.inner.lock();
        if shared.phase == Phase::Stopped {
            drop(shared);
            entry.abort();
            return;
        }
        if shared.phase == Phase::Idle {
            shared.phase = Phase::Filling;
        }

        shared.buffer.push(entry);
        self.inner.report.buffer_length(shared.buffer.len());

        let saturated =
            shared.phase == Phase::Filling && shared.buffer.len() > self.inner.watermark;
        if saturated {
            shared.phase = Phase::Draining;
            shared.saturated = true;
        }
        drop(shared);

        if saturated {
            debug!("{}: buffer over its watermark, pausing input", self.inner.service_name);
            self.inner.scheduler.saturate();
            self.spawn_drain();
        }
    }

    /// Signal the end of input. `continuation` is invoked once every buffered
    /// record has completed, or with `StreamEnd::Aborted` if the stage stopped.
    pub fn signal_end(&self, continuation: Continuation<StreamEnd>) {
        if !self.inner.enabled {
            continuation.complete(StreamEnd::Completed);
            return;
        }

        let mut shared = self.inner.lock();
        match shared.phase {
            Phase::Stopped => {
                let outcome = shared.outcome.unwrap_or(StreamEnd::Completed);
                drop(shared);
                continuation.complete(outcome);
            }
            Phase::Draining | Phase::Finalizing => {
                if !shared.ends.is_empty() {
                    warn!("{}: end of input signaled more than once", self.inner.service_name);
                }
                shared.ends.push(continuation);
                shared.phase = Phase::Finalizing;
            }
            Phase::Idle | Phase::Filling => {
                shared.ends.push(continuation);
                shared.phase = Phase::Finalizing;
                drop(shared);
                self.spawn_drain();
            }
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Records waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn report(&self) -> Arc<Report> {
        self.inner.report.clone()
    }

    fn spawn_drain(&self) {
        tokio::spawn(drain(self.inner.clone()));
    }
}

/// Drain the buffer packet by packet until it falls below the watermark, or
/// until it is empty once the end of input was signalled.
async fn drain(inner: Arc<Inner>) {
    let mut worker = inner.worker.lock().await;

    loop {
        if !should_continue(&inner) {
            return;
        }

        let packet = worker.assembler.assemble(|| inner.pop()).await;
        if packet.is_empty() {
            continue;
        }

        match worker.resolver.resolve(packet.keys()).await {
            Ok(Resolution::Resolved(documents)) => worker.merger.merge(packet, documents).await,
            Ok(Resolution::Skipped) => packet.pass_through(),
            Err(error) => {
                stop(&inner, packet, error);
                return;
            }
        }
    }
}

/// Check the drain condition, and leave the draining phase in the same critical
/// section when it no longer holds.
fn should_continue(inner: &Inner) -> bool {
    let mut shared = inner.lock();
    if shared.phase == Phase::Stopped {
        return false;
    }

    let length = shared.buffer.len();
    let ending = !shared.ends.is_empty();
    if length > 0 && (length >= inner.watermark || ending) {
        return true;
    }

    let resume = std::mem::take(&mut shared.saturated);
    let ends = std::mem::take(&mut shared.ends);
    if !ends.is_empty() {
        shared.phase = Phase::Stopped;
        shared.outcome = Some(StreamEnd::Completed);
    } else {
        shared.phase = Phase::Filling;
    }
    drop(shared);

    if resume {
        debug!("{}: buffer drained, resuming input", inner.service_name);
        inner.scheduler.drain();
    }
    if !ends.is_empty() {
        info!("{}: end of input, all records processed", inner.service_name);
    }
    for end in ends {
        end.complete(StreamEnd::Completed);
    }

    false
}

fn stop(inner: &Inner, packet: Packet, error: PipelineError) {
    error!("{}: stopping enrichment: {error}", inner.service_name);

    let mut shared = inner.lock();
    shared.phase = Phase::Stopped;
    shared.outcome = Some(StreamEnd::Aborted);
    shared.saturated = false;
    let buffered = shared.buffer.take_all();
    let ends = std::mem::take(&mut shared.ends);
    inner.report.buffer_length(0);
    drop(shared);

    inner.job.stop(&error);

    packet.abort();
    for entry in buffered {
        entry.abort();
    }
    for end in ends {
        end.complete(StreamEnd::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use enrich_common::cache::{MockCache, MockCacheCall};
    use serde_json::json;

    use super::*;
    use crate::test_utils::{record, settings, RecordingJob, RecordingScheduler, ScriptedService};

    async fn stage(
        settings: StageSettings,
        service: ScriptedService,
        cache: Option<MockCache>,
    ) -> (EnrichmentStage, Arc<RecordingScheduler>, Arc<RecordingJob>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let job = Arc::new(RecordingJob::default());
        let cache = cache.map(|cache| -> Arc<dyn Cache> { Arc::new(cache) });
        let stage = EnrichmentStage::build(
            settings,
            Arc::new(service),
            cache,
            scheduler.clone(),
            job.clone(),
        )
        .await
        .unwrap();
        (stage, scheduler, job)
    }

    #[tokio::test]
    async fn test_build_ensures_cache_indexes() {
        let cache = MockCache::new();
        let (_stage, _, _) = stage(settings(), ScriptedService::new(), Some(cache.clone())).await;

        assert_eq!(
            cache.calls(),
            vec![MockCacheCall::EnsureIndexes(settings().cache_ttl)]
        );
    }

    #[tokio::test]
    async fn test_build_fails_when_cache_is_unavailable() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let job = Arc::new(RecordingJob::default());

        let result = EnrichmentStage::build(
            settings(),
            Arc::new(ScriptedService::new()),
            Some(Arc::new(MockCache::new().unavailable())),
            scheduler,
            job,
        )
        .await;

        assert!(matches!(result, Err(SetupError::CacheUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_packet_size_is_capped_by_the_service() {
        let service = ScriptedService::new().with_max_packet_size(2);
        let (stage, _, _) = stage(
            StageSettings {
                packet_size: 50,
                ..settings()
            },
            service.clone(),
            None,
        )
        .await;

        for doi in ["10.1/a", "10.1/b", "10.1/c"] {
            stage.enqueue(record(json!({ "doi": doi })), Continuation::new(|_| {}));
        }
        let (end, done) = Continuation::channel();
        stage.signal_end(end);
        assert_eq!(done.await.unwrap(), StreamEnd::Completed);

        assert!(service.queries().iter().all(|keys| keys.len() <= 2));
        assert_eq!(service.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_stage_passes_records_through() {
        let service = ScriptedService::new();
        let (stage, scheduler, _) = stage(
            StageSettings {
                enabled: false,
                ..settings()
            },
            service.clone(),
            None,
        )
        .await;

        let (continuation, rx) = Continuation::channel();
        stage.enqueue(record(json!({"doi": "10.1/a"})), continuation);

        assert_eq!(rx.await.unwrap(), Completion::Keep(record(json!({"doi": "10.1/a"}))));
        assert!(service.queries().is_empty());
        assert!(scheduler.events().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_aborts_immediately() {
        let service = ScriptedService::new().failing(vec![crate::error::QueryError::Authentication(
            "revoked".to_owned(),
        )]);
        let (stage, _, job) = stage(settings(), service, None).await;

        let (first, first_rx) = Continuation::channel();
        stage.enqueue(record(json!({"doi": "10.1/a"})), first);
        let (end, done) = Continuation::channel();
        stage.signal_end(end);

        assert!(matches!(first_rx.await.unwrap(), Completion::Aborted(_)));
        assert_eq!(done.await.unwrap(), StreamEnd::Aborted);
        assert_eq!(stage.phase(), Phase::Stopped);
        assert_eq!(job.errors().len(), 1);

        let (late, late_rx) = Continuation::channel();
        stage.enqueue(record(json!({"doi": "10.1/b"})), late);
        assert!(matches!(late_rx.await.unwrap(), Completion::Aborted(_)));
    }

    #[tokio::test]
    async fn test_every_end_signal_completes() {
        let service = ScriptedService::new().with_latency(Duration::from_millis(10));
        let (stage, _, _) = stage(settings(), service, None).await;

        let (continuation, completed) = Continuation::channel();
        stage.enqueue(record(json!({"doi": "10.1/a"})), continuation);
        let (first, first_done) = Continuation::channel();
        stage.signal_end(first);
        let (second, second_done) = Continuation::channel();
        stage.signal_end(second);

        assert!(completed.await.unwrap().is_keep());
        assert_eq!(first_done.await.unwrap(), StreamEnd::Completed);
        assert_eq!(second_done.await.unwrap(), StreamEnd::Completed);
        assert_eq!(stage.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_end_of_empty_stream_completes() {
        let (stage, scheduler, _) = stage(settings(), ScriptedService::new(), None).await;

        let (end, done) = Continuation::channel();
        stage.signal_end(end);

        assert_eq!(done.await.unwrap(), StreamEnd::Completed);
        assert_eq!(stage.phase(), Phase::Stopped);
        assert!(scheduler.events().is_empty());
    }
}
