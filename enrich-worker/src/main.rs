//! Enrich newline-delimited JSON records read from stdin and write them to stdout.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::{eyre, WrapErr};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use enrich_common::cache::{Cache, MemoryCache, RedisCache};
use enrich_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use enrich_worker::config::{CacheBackend, Config, ServiceName};
use enrich_worker::host::{JobHandle, PauseGate};
use enrich_worker::record::{Completion, Continuation, Record, StreamEnd};
use enrich_worker::service::EnrichmentService;
use enrich_worker::services::{HalClient, OpenAlexClient};
use enrich_worker::stage::EnrichmentStage;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;
    let settings = config.stage_settings()?;
    let timeout = config.resolver.request_timeout.0;

    let service: Arc<dyn EnrichmentService> = match config.service {
        ServiceName::OpenAlex => Arc::new(OpenAlexClient::new(
            &config.openalex.openalex_url,
            config.openalex.mailto(),
            config.openalex.openalex_api_key.clone(),
            timeout,
        )?),
        ServiceName::Hal => Arc::new(HalClient::new(&config.hal.hal_url, timeout)?),
    };

    let backend = (config.cache.cache_enabled, config.cache.cache_backend);
    let cache: Option<Arc<dyn Cache>> = match backend {
        (false, _) => None,
        (true, CacheBackend::Redis) => Some(Arc::new(RedisCache::new(
            &config.cache.redis_url,
            &format!("{}:", service.name()),
        )?)),
        (true, CacheBackend::Memory) => Some(Arc::new(MemoryCache::new(
            config.cache.memory_cache_capacity,
            settings.cache_ttl,
        ))),
    };

    info!(
        "enriching with {} (cache: {}, packet size: {}, buffer size: {})",
        service.name(),
        cache.is_some(),
        settings.packet_size,
        settings.watermark
    );

    let gate = Arc::new(PauseGate::new());
    let job = Arc::new(JobHandle::default());
    let stage = EnrichmentStage::build(settings, service, cache, gate.clone(), job.clone()).await?;

    let recorder_handle = setup_metrics_recorder()?;
    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_metrics_router(recorder_handle);
        if let Err(error) = serve(router, &bind).await {
            warn!("failed to serve metrics on {bind}: {error}");
        }
    });

    let (sender, receiver) = mpsc::unbounded_channel();
    let writer = tokio::task::spawn(write_records(receiver));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        tokio::select! {
            _ = gate.wait_until_open() => {}
            _ = job.stopped() => break,
        }
        if job.error().is_some() {
            break;
        }

        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(error) => {
                warn!("skipping a line that is not a JSON object: {error}");
                continue;
            }
        };

        let sender = sender.clone();
        stage.enqueue(
            record,
            Continuation::new(move |completion| {
                if sender.send(completion).is_err() {
                    warn!("record completed after the writer stopped");
                }
            }),
        );
    }

    let (end, ended) = Continuation::channel();
    stage.signal_end(end);
    let outcome = ended.await.wrap_err("stage dropped the end of input")?;

    drop(sender);
    drop(stage);
    let written = tokio::time::timeout(Duration::from_secs(30), writer)
        .await
        .wrap_err("timed out flushing records")???;
    info!("{written} records written");

    match (outcome, job.error()) {
        (StreamEnd::Completed, None) => Ok(()),
        (_, Some(error)) => Err(eyre!("enrichment stopped: {error}")),
        (StreamEnd::Aborted, None) => Err(eyre!("enrichment aborted")),
    }
}

/// Write kept records as NDJSON, in completion order.
async fn write_records(mut receiver: mpsc::UnboundedReceiver<Completion>) -> eyre::Result<u64> {
    let mut stdout = tokio::io::stdout();
    let mut written = 0;

    while let Some(completion) = receiver.recv().await {
        match completion {
            Completion::Keep(record) => {
                let mut line = serde_json::to_vec(&record)?;
                line.push(b'\n');
                stdout.write_all(&line).await?;
                written += 1;
            }
            Completion::Discard { reason, .. } => {
                tracing::debug!("record discarded: {reason}");
            }
            Completion::Aborted(_) => {}
        }
    }

    stdout.flush().await?;
    Ok(written)
}
