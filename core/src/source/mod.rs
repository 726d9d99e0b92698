pub mod backoff;
pub mod classify;
pub mod concurrent;
pub mod offsets;
pub mod result;
mod worker;
pub mod want;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::broker::Record;
use crate::errors::{BrokerError, FetcherError};

pub use concurrent::ConcurrentFetchers;

/// Records of one partition handed to the consumer, in offset order.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub topic: String,
    pub partition: i32,
    pub records: Vec<Record>,
    /// `-1` when unknown.
    pub high_watermark: i64,
    pub log_start_offset: i64,
    /// The last error hit while fetching these records. The fetcher already
    /// handled it; it is informational.
    pub error: Option<BrokerError>,
    /// Context of the fetch the records came from.
    pub span: Span,
}

impl FetchBatch {
    pub fn empty(topic: String, partition: i32) -> Self {
        Self {
            topic,
            partition,
            records: Vec::new(),
            high_watermark: -1,
            log_start_offset: -1,
            error: None,
            span: Span::none(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    pub fn value_bytes(&self) -> usize {
        self.records.iter().map(|r| r.value.len()).sum()
    }
}

/// A source of records of a single partition.
///
/// Records are returned in offset order and never twice, across restarts
/// with [`Fetcher::update`] too.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send {
    /// Waits for the next records. Returns an empty batch when `cancel` is
    /// cancelled first or the fetcher is stopped.
    async fn poll_fetches(&mut self, cancel: &CancellationToken) -> FetchBatch;

    /// Restarts fetching with a different concurrency, right after the last
    /// returned record. Records buffered so far are dropped and fetched again.
    async fn update(&mut self, concurrency: usize) -> Result<(), FetcherError>;

    /// Stops fetching and drops buffered records. Calling it again does
    /// nothing.
    async fn stop(&mut self);

    fn buffered_records(&self) -> i64;

    fn buffered_bytes(&self) -> i64;

    fn bytes_per_record(&self) -> i64;
}
