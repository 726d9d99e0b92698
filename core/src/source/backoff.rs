use std::time::Duration;

use adaptive_backoff::prelude::{
    Backoff as _, BackoffBuilder, ExponentialBackoff, ExponentialBackoffBuilder,
};
use tokio_util::sync::CancellationToken;

pub const MIN_BACKOFF: Duration = Duration::from_millis(250);
pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_FACTOR: f64 = 2.0;

/// Exponential backoff bound to a cancellation token.
///
/// Retries are unbounded: the backoff is ongoing until the token is
/// cancelled, and a pending [`Backoff::wait`] returns as soon as it is.
pub struct Backoff {
    delays: ExponentialBackoff,
    stop: CancellationToken,
}

impl Backoff {
    pub fn new(stop: CancellationToken) -> anyhow::Result<Self> {
        Self::with_bounds(stop, MIN_BACKOFF, MAX_BACKOFF)
    }

    pub fn with_bounds(
        stop: CancellationToken,
        min: Duration,
        max: Duration,
    ) -> anyhow::Result<Self> {
        let delays = ExponentialBackoffBuilder::default()
            .factor(BACKOFF_FACTOR)
            .min(min)
            .max(max)
            .build()?;
        Ok(Self { delays, stop })
    }

    pub fn ongoing(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Sleeps for the current delay, which grows with every call.
    pub async fn wait(&mut self) {
        let delay = self.delays.wait();
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    pub fn reset(&mut self) {
        self.delays.reset();
    }
}
