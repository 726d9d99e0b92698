use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::IngestionError;
use crate::sink::Sink;
use crate::source::{FetchBatch, Fetcher};
use crate::telemetry::{FetcherMetrics, IngestMetrics};

/// The ingestor orchestrates the data flow from source -> sink.
pub struct Ingestor {
    fetcher: Box<dyn Fetcher>,
    sink: Box<dyn Sink>,
    fetcher_metrics: Option<Arc<FetcherMetrics>>,
    /// A batch the sink failed to take; written again before anything new
    /// is polled, since the fetcher won't return its records again.
    pending: Option<FetchBatch>,
    metrics: IngestMetrics,
}

impl Ingestor {
    pub fn new(fetcher: Box<dyn Fetcher>, sink: Box<dyn Sink>) -> Self {
        Self {
            fetcher,
            sink,
            fetcher_metrics: None,
            pending: None,
            metrics: IngestMetrics::default(),
        }
    }

    /// Includes the fetcher's metrics in [`Ingestor::metrics`].
    pub fn with_fetcher_metrics(mut self, metrics: Arc<FetcherMetrics>) -> Self {
        self.fetcher_metrics = Some(metrics);
        self
    }

    /// Runs a single poll-write cycle and returns the number of records
    /// written. This is the main unit of work to be called by a runner.
    ///
    /// High-level logic:
    /// 1. Poll the next ordered batch from the fetcher, unless a batch the
    ///    sink rejected before is still pending.
    /// 2. Write the batch to the sink.
    /// 3. Advance the last consumed offset.
    pub async fn run_once(&mut self, cancel: &CancellationToken) -> Result<usize, IngestionError> {
        let batch = match self.pending.take() {
            Some(batch) => batch,
            None => self.fetcher.poll_fetches(cancel).await,
        };
        if batch.is_empty() {
            self.metrics.empty_polls += 1;
            return Ok(0);
        }

        if let Err(err) = self.sink.write(&batch).await {
            warn!(
                first_offset = ?batch.records.first().map(|r| r.offset),
                records = batch.records.len(),
                err = %err,
                "failed to write batch to sink; will retry"
            );
            self.pending = Some(batch);
            return Err(err.into());
        }

        let records = batch.records.len();
        self.metrics.batches_processed += 1;
        self.metrics.records_processed += records;
        self.metrics.bytes_processed += batch.value_bytes() as u64;
        self.metrics.last_consumed_offset = batch.last_offset();
        Ok(records)
    }

    /// Flushes the sink and stops the fetcher. This MUST be called during a
    /// graceful shutdown.
    pub async fn shutdown(&mut self) -> Result<(), IngestionError> {
        let flushed = self.sink.flush().await;
        self.fetcher.stop().await;
        flushed?;

        info!(
            last_consumed_offset = ?self.metrics.last_consumed_offset,
            records_processed = self.metrics.records_processed,
            "ingestor shut down"
        );
        Ok(())
    }

    pub fn metrics(&self) -> IngestMetrics {
        IngestMetrics {
            fetcher: self.fetcher_metrics.as_ref().map(|m| m.snapshot()),
            ..self.metrics.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::broker::Record;
    use crate::errors::SinkError;
    use crate::sink::MockSink;
    use crate::source::MockFetcher;

    fn batch(offsets: std::ops::Range<i64>) -> FetchBatch {
        let mut batch = FetchBatch::empty("ingest".to_string(), 0);
        batch.records = offsets
            .map(|offset| Record {
                offset,
                key: None,
                value: vec![0; 4],
                timestamp: None,
                headers: Vec::new(),
            })
            .collect();
        batch
    }

    #[tokio::test]
    async fn test_run_once_writes_batches_in_order() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut fetcher = MockFetcher::new();
        let counter = polls.clone();
        fetcher.expect_poll_fetches().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => batch(0..3),
                1 => batch(3..3),
                _ => batch(3..5),
            }
        });
        let mut sink = MockSink::new();
        sink.expect_write().times(2).returning(|_| Ok(()));

        let mut ingestor = Ingestor::new(Box::new(fetcher), Box::new(sink));
        let cancel = CancellationToken::new();
        assert_eq!(ingestor.run_once(&cancel).await.unwrap(), 3);
        assert_eq!(ingestor.run_once(&cancel).await.unwrap(), 0);
        assert_eq!(ingestor.run_once(&cancel).await.unwrap(), 2);

        let metrics = ingestor.metrics();
        assert_eq!(metrics.batches_processed, 2);
        assert_eq!(metrics.records_processed, 5);
        assert_eq!(metrics.bytes_processed, 20);
        assert_eq!(metrics.empty_polls, 1);
        assert_eq!(metrics.last_consumed_offset, Some(4));
        assert!(metrics.fetcher.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_before_polling() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_poll_fetches().times(1).returning(|_| batch(0..2));
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        let mut sink = MockSink::new();
        sink.expect_write()
            .withf(|batch| batch.last_offset() == Some(1))
            .returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SinkError::Write {
                        reason: "disk full".to_string(),
                    })
                } else {
                    Ok(())
                }
            });

        let mut ingestor = Ingestor::new(Box::new(fetcher), Box::new(sink));
        let cancel = CancellationToken::new();
        let err = ingestor.run_once(&cancel).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ingestor.run_once(&cancel).await.unwrap(), 2);
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert_eq!(ingestor.metrics().last_consumed_offset, Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_stop().times(1).returning(|| ());
        let mut sink = MockSink::new();
        sink.expect_flush().times(1).returning(|| {
            Err(SinkError::Flush {
                reason: "closed".to_string(),
            })
        });

        let mut ingestor = Ingestor::new(Box::new(fetcher), Box::new(sink))
            .with_fetcher_metrics(Arc::new(FetcherMetrics::new().unwrap()));
        // The fetcher is stopped even if flushing fails.
        assert!(ingestor.shutdown().await.is_err());
        assert!(ingestor.metrics().fetcher.is_some());
    }
}
