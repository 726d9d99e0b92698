//! Fetches one partition with several concurrent requests while returning
//! records strictly in offset order.
//!
//! A dispatcher task splits the partition into adjacent offset ranges (wants)
//! and hands each to an idle fetch worker. Every want has its own result
//! channel; the dispatcher only ever reads the channel of the oldest want in
//! flight, so results reach the consumer in order no matter which worker
//! finishes first.

use std::collections::VecDeque;
use std::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::broker::Broker;
use crate::config::FetcherConfig;
use crate::errors::FetcherError;
use crate::source::offsets::{StartOffsetReader, resolve_start_offset};
use crate::source::result::FetchResult;
use crate::source::want::{FetchWant, INITIAL_BYTES_PER_RECORD};
use crate::source::worker::{DispatchedWant, FetchContext, FetchWorker, WorkerSlot};
use crate::source::{FetchBatch, Fetcher};
use crate::telemetry::FetcherMetrics;

/// The wants handed to workers whose results were not all read yet, oldest
/// first. Their max bytes at dispatch time add up to the buffered bytes.
struct InflightWants {
    wants: VecDeque<InflightWant>,
    ctx: Arc<FetchContext>,
}

struct InflightWant {
    max_bytes: i32,
    results: mpsc::Receiver<FetchResult>,
}

impl InflightWants {
    fn new(ctx: Arc<FetchContext>) -> Self {
        Self {
            wants: VecDeque::new(),
            ctx,
        }
    }

    fn is_empty(&self) -> bool {
        self.wants.is_empty()
    }

    fn append(&mut self, max_bytes: i32, results: mpsc::Receiver<FetchResult>) {
        self.ctx
            .buffered_bytes
            .fetch_add(max_bytes as i64, Ordering::Relaxed);
        self.wants.push_back(InflightWant { max_bytes, results });
    }

    /// The next result of the oldest want, or `None` once that want is done.
    /// Never resolves while nothing is in flight.
    async fn recv_head(&mut self) -> Option<FetchResult> {
        match self.wants.front_mut() {
            Some(head) => head.results.recv().await,
            None => future::pending().await,
        }
    }

    fn remove_head(&mut self) {
        // The want's estimate may have changed while it was fetched; what it
        // was accounted for when dispatched is what is subtracted.
        if let Some(head) = self.wants.pop_front() {
            self.ctx
                .buffered_bytes
                .fetch_sub(head.max_bytes as i64, Ordering::Relaxed);
        }
    }
}

struct Dispatcher {
    ctx: Arc<FetchContext>,
    stop: CancellationToken,
    high_watermark: Arc<AtomicI64>,
    max_buffered_bytes: i32,
    next_want: FetchWant,
    inflight: InflightWants,
    /// The next result for the consumer, once read from its want.
    ready: Option<FetchResult>,
    idle_workers: mpsc::Receiver<WorkerSlot>,
}

impl Dispatcher {
    /// Runs until stopped, sending results in offset order to `ordered`.
    async fn run(mut self, ordered: mpsc::Sender<FetchResult>) {
        loop {
            let dispatch = self.can_dispatch();
            let has_ready = self.ready.is_some();

            tokio::select! {
                _ = self.stop.cancelled() => break,

                Some(slot) = self.idle_workers.recv(), if dispatch => self.dispatch(slot),

                result = self.inflight.recv_head(), if !has_ready => match result {
                    Some(result) => self.prepare(result),
                    None => self.inflight.remove_head(),
                },

                permit = ordered.reserve(), if has_ready => {
                    let Ok(permit) = permit else {
                        // The consumer side is gone.
                        break;
                    };
                    if let Some(mut result) = self.ready.take() {
                        let waited = result.finish_waiting_for_consumption();
                        self.ctx
                            .metrics
                            .consumption_wait_duration
                            .observe(waited.as_secs_f64());
                        permit.send(result);
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// At least one want is always in flight, otherwise the high watermark
    /// would never move. Beyond that, wants are only dispatched while they
    /// fit the buffered bytes limit and start at an offset that exists.
    fn can_dispatch(&self) -> bool {
        if self.inflight.is_empty() {
            return true;
        }
        let buffered = self.ctx.buffered_bytes.load(Ordering::Relaxed);
        buffered + self.next_want.max_bytes() as i64 <= self.max_buffered_bytes as i64
            && self.next_want.start_offset <= self.high_watermark.load(Ordering::Acquire)
    }

    fn dispatch(&mut self, slot: WorkerSlot) {
        let want = self.next_want;
        let (results_tx, results_rx) = mpsc::channel(1);
        let dispatched = DispatchedWant {
            want,
            results: results_tx,
        };
        // A worker that stopped in the meantime leaves the want to the next
        // idle worker.
        if slot.send(dispatched).is_ok() {
            self.inflight.append(want.max_bytes(), results_rx);
            self.next_want = want.next().trimmed();
        }
    }

    fn prepare(&mut self, mut result: FetchResult) {
        self.next_want = self
            .next_want
            .update_bytes_per_record(result.fetched_bytes, result.records.len())
            .trimmed();
        self.ctx
            .estimated_bytes_per_record
            .store(self.next_want.estimated_bytes_per_record, Ordering::Relaxed);

        result.start_waiting_for_consumption();
        self.ready = Some(result);
    }
}

/// One run of the dispatcher and its workers.
struct Run {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Fetches a single partition with `concurrency` parallel fetch requests and
/// returns the records in order through [`Fetcher::poll_fetches`].
pub struct ConcurrentFetchers {
    ctx: Arc<FetchContext>,
    max_buffered_bytes: i32,
    /// Cancelled when the fetchers are dropped; every run stops with it.
    root: CancellationToken,
    run: Option<Run>,
    ordered: mpsc::Receiver<FetchResult>,
    /// Offset of the last record returned by `poll_fetches`.
    last_returned_offset: i64,
}

impl ConcurrentFetchers {
    /// Resolves the start offset and the topic ID, then starts fetching.
    pub async fn new(
        broker: Arc<dyn Broker>,
        topic: &str,
        partition: i32,
        config: &FetcherConfig,
        metrics: Arc<FetcherMetrics>,
    ) -> Result<Self, FetcherError> {
        if config.concurrency == 0 {
            return Err(FetcherError::InvalidConcurrency(config.concurrency));
        }
        config.validate()?;

        let start_offset =
            resolve_start_offset(broker.as_ref(), topic, partition, config.start_offset).await?;

        let topics = broker
            .list_topics(&[topic.to_string()])
            .await
            .map_err(|source| FetcherError::TopicMetadata {
                topic: topic.to_string(),
                source,
            })?;
        let metadata = topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| FetcherError::TopicNotFound {
                topic: topic.to_string(),
            })?;
        if let Some(source) = metadata.error {
            return Err(FetcherError::TopicMetadata {
                topic: topic.to_string(),
                source,
            });
        }

        let start_offsets = StartOffsetReader::start(
            broker.clone(),
            topic.to_string(),
            partition,
            config.start_offset_refresh_interval(),
        )
        .await;

        let ctx = Arc::new(FetchContext {
            broker,
            topic: topic.to_string(),
            topic_id: metadata.id,
            partition,
            min_bytes_wait_time: config.min_bytes_wait_time(),
            track_compressed_bytes: config.track_compressed_bytes,
            start_offsets,
            metrics,
            buffered_records: AtomicI64::new(0),
            buffered_bytes: AtomicI64::new(0),
            estimated_bytes_per_record: AtomicI64::new(INITIAL_BYTES_PER_RECORD),
        });

        // Replaced by the first run.
        let (_, ordered) = mpsc::channel(1);
        let mut fetchers = Self {
            ctx,
            max_buffered_bytes: config.max_buffered_bytes_limit(),
            root: CancellationToken::new(),
            run: None,
            ordered,
            last_returned_offset: start_offset - 1,
        };
        fetchers.start(start_offset, config.concurrency);
        Ok(fetchers)
    }

    pub fn last_returned_offset(&self) -> i64 {
        self.last_returned_offset
    }

    fn start(&mut self, start_offset: i64, concurrency: usize) {
        let target_bytes_per_fetch = self.max_buffered_bytes as i64 / concurrency as i64;
        info!(
            topic = %self.ctx.topic,
            partition = self.ctx.partition,
            start_offset,
            concurrency,
            bytes_per_fetch_request = target_bytes_per_fetch,
            "starting concurrent fetchers"
        );

        let stop = self.root.child_token();
        // Updated by the workers. Zero is the same as no produced records,
        // which doesn't block progress since one want is always in flight.
        let high_watermark = Arc::new(AtomicI64::new(0));
        let (idle_tx, idle_rx) = mpsc::channel(concurrency);
        let (ordered_tx, ordered_rx) = mpsc::channel(1);

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for id in 0..concurrency {
            let worker = FetchWorker {
                id,
                ctx: self.ctx.clone(),
                stop: stop.clone(),
                high_watermark: high_watermark.clone(),
            };
            tasks.push(tokio::spawn(worker.run(idle_tx.clone())));
        }

        let dispatcher = Dispatcher {
            ctx: self.ctx.clone(),
            stop: stop.clone(),
            high_watermark,
            max_buffered_bytes: self.max_buffered_bytes,
            next_want: FetchWant::from_offset(
                start_offset,
                target_bytes_per_fetch,
                INITIAL_BYTES_PER_RECORD,
            )
            .trimmed(),
            inflight: InflightWants::new(self.ctx.clone()),
            ready: None,
            idle_workers: idle_rx,
        };
        let span = info_span!("concurrent_fetchers", topic = %self.ctx.topic, partition = self.ctx.partition);
        tasks.push(tokio::spawn(dispatcher.run(ordered_tx).instrument(span)));

        self.ordered = ordered_rx;
        self.run = Some(Run { stop, tasks });
    }

    /// Counts the records dropped because they were returned before, which
    /// happens when wants overlap or a want is retried.
    fn record_ordered_fetch_telemetry(
        &self,
        result: &FetchResult,
        first_unreturned: usize,
        wait_start: Instant,
    ) {
        let waited = wait_start.elapsed();
        debug!(
            num_records = result.records.len(),
            wait_duration = ?waited,
            "received ordered fetch"
        );
        self.ctx.metrics.fetch_wait_duration.observe(waited.as_secs_f64());

        let skipped = &result.records[..first_unreturned];
        let (Some(first), Some(last)) = (skipped.first(), skipped.last()) else {
            return;
        };
        let discarded_bytes: usize = skipped.iter().map(|r| r.value.len()).sum();
        self.ctx
            .metrics
            .fetched_discarded_record_bytes
            .inc_by(discarded_bytes as u64);
        debug!(
            parent: &result.span,
            skipped_records_count = skipped.len(),
            first_skipped_offset = first.offset,
            last_skipped_offset = last.offset,
            "skipped records because they were already returned"
        );
    }

    fn empty_batch(&self) -> FetchBatch {
        FetchBatch::empty(self.ctx.topic.clone(), self.ctx.partition)
    }
}

#[async_trait]
impl Fetcher for ConcurrentFetchers {
    async fn poll_fetches(&mut self, cancel: &CancellationToken) -> FetchBatch {
        let wait_start = Instant::now();
        let received = tokio::select! {
            _ = cancel.cancelled() => return self.empty_batch(),
            received = self.ordered.recv() => received,
        };
        // Stopped.
        let Some(mut result) = received else {
            return self.empty_batch();
        };

        // Everything received counts as unbuffered, including the records
        // dropped below.
        self.ctx.add_buffered_records(-(result.records.len() as i64));

        let first_unreturned = result
            .records
            .iter()
            .position(|r| r.offset > self.last_returned_offset)
            .unwrap_or(result.records.len());
        self.record_ordered_fetch_telemetry(&result, first_unreturned, wait_start);

        result.records.drain(..first_unreturned);
        if let Some(last) = result.records.last() {
            self.last_returned_offset = last.offset;
        }

        FetchBatch {
            topic: self.ctx.topic.clone(),
            partition: self.ctx.partition,
            records: result.records,
            high_watermark: result.high_watermark,
            log_start_offset: result.log_start_offset,
            error: result.error,
            span: result.span,
        }
    }

    async fn update(&mut self, concurrency: usize) -> Result<(), FetcherError> {
        if concurrency == 0 {
            return Err(FetcherError::InvalidConcurrency(concurrency));
        }
        self.stop().await;
        self.start(self.last_returned_offset + 1, concurrency);
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };
        run.stop.cancel();
        for joined in join_all(run.tasks).await {
            if let Err(err) = joined {
                warn!(err = %err, "concurrent fetcher task failed");
            }
        }

        // Buffered records are dropped on purpose.
        self.ordered.close();
        while self.ordered.try_recv().is_ok() {}
        self.ctx.reset_buffered();

        info!(
            last_returned_record = self.last_returned_offset,
            "stopped concurrent fetchers"
        );
    }

    fn buffered_records(&self) -> i64 {
        self.ctx.buffered_records.load(Ordering::Relaxed)
    }

    fn buffered_bytes(&self) -> i64 {
        self.ctx.buffered_bytes.load(Ordering::Relaxed)
    }

    fn bytes_per_record(&self) -> i64 {
        self.ctx.estimated_bytes_per_record.load(Ordering::Relaxed)
    }
}

impl Drop for ConcurrentFetchers {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
