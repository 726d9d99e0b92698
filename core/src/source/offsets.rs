use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::broker::{Broker, OffsetSpec};
use crate::config::StartOffset;
use crate::errors::{BrokerError, FetcherError};

/// Resolves where a new fetcher starts consuming.
pub async fn resolve_start_offset(
    broker: &dyn Broker,
    topic: &str,
    partition: i32,
    start: StartOffset,
) -> Result<i64, FetcherError> {
    let spec = match start {
        StartOffset::At(offset) => return Ok(offset),
        StartOffset::Earliest => OffsetSpec::Earliest,
        StartOffset::Latest => OffsetSpec::Latest,
    };
    broker
        .list_offset(topic, partition, spec)
        .await
        .map_err(FetcherError::ResolveStartOffset)
}

/// Keeps the log start offset of a partition up to date in the background.
///
/// Retention moves the start offset forward over time; fetch workers use the
/// cached value to skip records that no longer exist. The refresh task stops
/// when the reader is dropped.
#[derive(Debug)]
pub struct StartOffsetReader {
    offset: watch::Receiver<Option<i64>>,
    _guard: DropGuard,
}

impl StartOffsetReader {
    /// Reads the start offset once, then spawns a task refreshing it every
    /// `interval`. A failed first read is not an error: the offset is
    /// reported as unavailable until a refresh succeeds.
    pub async fn start(
        broker: Arc<dyn Broker>,
        topic: String,
        partition: i32,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();

        refresh(broker.as_ref(), &topic, partition, &tx).await;

        let stop = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => refresh(broker.as_ref(), &topic, partition, &tx).await,
                }
            }
            debug!(topic = %topic, partition, "stopped partition start offset reader");
        });

        Self {
            offset: rx,
            _guard: token.drop_guard(),
        }
    }

    /// The last start offset read from the broker.
    pub fn cached_offset(&self) -> Result<i64, BrokerError> {
        (*self.offset.borrow()).ok_or(BrokerError::StartOffsetUnavailable)
    }
}

async fn refresh(
    broker: &dyn Broker,
    topic: &str,
    partition: i32,
    tx: &watch::Sender<Option<i64>>,
) {
    match broker.list_offset(topic, partition, OffsetSpec::Earliest).await {
        Ok(offset) => {
            tx.send_if_modified(|current| {
                let changed = *current != Some(offset);
                *current = Some(offset);
                changed
            });
        }
        Err(err) => warn!(topic, partition, err = %err, "failed to read partition start offset"),
    }
}
