use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::errors::SinkError;
use crate::sink::Sink;
use crate::source::FetchBatch;

/// Logs every batch it is handed and counts records and bytes. Used for dry
/// runs of the ingestor.
#[derive(Debug, Default)]
pub struct LogSink {
    records: AtomicU64,
    bytes: AtomicU64,
    unflushed_records: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn write(&self, batch: &FetchBatch) -> Result<(), SinkError> {
        let (Some(first), Some(last)) = (batch.records.first(), batch.records.last()) else {
            return Ok(());
        };
        let count = batch.records.len() as u64;
        let bytes = batch.value_bytes() as u64;
        self.records.fetch_add(count, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.unflushed_records.fetch_add(count, Ordering::Relaxed);

        debug!(
            parent: &batch.span,
            topic = %batch.topic,
            partition = batch.partition,
            first_offset = first.offset,
            last_offset = last.offset,
            records = count,
            bytes,
            high_watermark = batch.high_watermark,
            "received batch"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let flushed = self.unflushed_records.swap(0, Ordering::Relaxed);
        info!(
            flushed_records = flushed,
            total_records = self.records(),
            total_bytes = self.bytes(),
            "flushed log sink"
        );
        Ok(())
    }
}
