pub mod log;

use async_trait::async_trait;

use crate::errors::SinkError;
use crate::source::FetchBatch;

pub use self::log::LogSink;

/// The `Sink` trait defines the contract for any destination system.
/// It is responsible for taking ordered batches of records and persisting them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sink: Send + Sync {
    /// Takes a batch of records, in offset order. A sink may buffer them
    /// until the next [`Sink::flush`].
    async fn write(&self, batch: &FetchBatch) -> Result<(), SinkError>;

    /// Persists everything written so far.
    async fn flush(&self) -> Result<(), SinkError>;
}
