use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ingest_fetch::broker::Broker;
use ingest_fetch::broker::kafka::RdKafkaBroker;
use ingest_fetch::config::load_config;
use ingest_fetch::ingestor::Ingestor;
use ingest_fetch::sink::LogSink;
use ingest_fetch::source::ConcurrentFetchers;
use ingest_fetch::telemetry::{FetcherMetrics, init_tracing};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// This is the entry point for running a long-running ingestion job on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the file given as first argument, or `INGEST_CONFIG`.
///     Main loop runs until a shutdown signal is received:
///         - fetch the partition concurrently, in offset order
///         - write the records to the sink
///     Flush the sink and stop the fetcher.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load config")?;
    config.validate().context("Invalid config")?;

    let broker: Arc<dyn Broker> = Arc::new(RdKafkaBroker::new(&config.kafka)?);
    let fetcher_metrics = Arc::new(FetcherMetrics::new()?);
    let fetcher = ConcurrentFetchers::new(
        broker,
        &config.kafka.topic,
        config.kafka.partition,
        &config.fetcher,
        fetcher_metrics.clone(),
    )
    .await
    .context("Failed to start fetching")?;
    info!(
        topic = %config.kafka.topic,
        partition = config.kafka.partition,
        start_offset = fetcher.last_returned_offset() + 1,
        concurrency = config.fetcher.concurrency,
        "started fetching"
    );

    let mut engine = Ingestor::new(Box::new(fetcher), Box::new(LogSink::new()))
        .with_fetcher_metrics(fetcher_metrics);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(err = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    // run_once isn't raced against anything else: dropping it mid-write
    // would lose the batch.
    let mut last_metrics_log = Instant::now();
    while !shutdown.is_cancelled() {
        if let Err(e) = engine.run_once(&shutdown).await {
            if !e.is_retryable() {
                error!(err = %e, "a fatal error occurred");
                engine.shutdown().await?;
                return Err(e.into());
            }
            let delay = Duration::from_millis(e.get_retry_delay_ms());
            warn!(err = %e, ?delay, "a transient error occurred, will retry");
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if last_metrics_log.elapsed() >= METRICS_LOG_INTERVAL {
            last_metrics_log = Instant::now();
            match serde_json::to_string(&engine.metrics()) {
                Ok(metrics) => info!(%metrics, "ingestion metrics"),
                Err(e) => warn!(err = %e, "failed to serialize metrics"),
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}
