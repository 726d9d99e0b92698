use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, error};

use crate::broker::{Broker, FetchRequest, FetchResponse, TopicId};
use crate::errors::{BrokerError, KafkaErrorCode};
use crate::source::backoff::Backoff;
use crate::source::classify::{RetryPolicy, classify_fetch_err};
use crate::source::offsets::StartOffsetReader;
use crate::source::result::FetchResult;
use crate::source::want::FetchWant;
use crate::telemetry::FetcherMetrics;

/// State shared by every task fetching one partition. It outlives restarts
/// of the fetcher.
pub(crate) struct FetchContext {
    pub broker: Arc<dyn Broker>,
    pub topic: String,
    pub topic_id: TopicId,
    pub partition: i32,
    pub min_bytes_wait_time: Duration,
    pub track_compressed_bytes: bool,
    pub start_offsets: StartOffsetReader,
    pub metrics: Arc<FetcherMetrics>,
    /// Records fetched but not yet returned to the consumer.
    pub buffered_records: AtomicI64,
    /// Sum of the max bytes of the wants in flight.
    pub buffered_bytes: AtomicI64,
    pub estimated_bytes_per_record: AtomicI64,
}

impl FetchContext {
    /// Adjusts the buffered records counter and its gauge; negative `delta`
    /// for records handed to the consumer.
    pub fn add_buffered_records(&self, delta: i64) {
        self.buffered_records.fetch_add(delta, Ordering::Relaxed);
        self.metrics.buffered_records.add(delta);
    }

    pub fn reset_buffered(&self) {
        self.buffered_records.store(0, Ordering::Relaxed);
        self.buffered_bytes.store(0, Ordering::Relaxed);
        self.metrics.buffered_records.set(0);
    }
}

/// A want handed to a worker, with the channel its results go to. Dropping
/// `results` tells the dispatcher the want is done.
#[derive(Debug)]
pub(crate) struct DispatchedWant {
    pub want: FetchWant,
    pub results: mpsc::Sender<FetchResult>,
}

/// An idle worker waits on the other end for its next want.
pub(crate) type WorkerSlot = oneshot::Sender<DispatchedWant>;

/// Fetch workers run until `stop` is cancelled. `high_watermark` is shared
/// by all the workers of a run.
pub(crate) struct FetchWorker {
    pub id: usize,
    pub ctx: Arc<FetchContext>,
    pub stop: CancellationToken,
    pub high_watermark: Arc<AtomicI64>,
}

impl FetchWorker {
    /// Announces itself on `idle` and fetches whatever want it's handed,
    /// until stopped.
    pub(crate) async fn run(self, idle: mpsc::Sender<WorkerSlot>) {
        let mut backoff = match Backoff::new(self.stop.clone()) {
            Ok(backoff) => backoff,
            Err(err) => {
                error!(fetcher = self.id, err = %err, "failed to create fetch backoff");
                return;
            }
        };
        loop {
            let (slot, next) = oneshot::channel();
            if idle.send(slot).await.is_err() {
                break;
            }
            let dispatched = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                dispatched = next => match dispatched {
                    Ok(dispatched) => dispatched,
                    Err(_) => break,
                },
            };

            let span = debug_span!(
                "fetch_want",
                fetcher = self.id,
                start_offset = dispatched.want.start_offset,
                end_offset = dispatched.want.end_offset,
            );
            self.fetch_want(dispatched, &mut backoff)
                .instrument(span)
                .await;
        }
        debug!(fetcher = self.id, "fetch worker stopped");
    }

    /// Fetches the want until all of its records were sent to the
    /// dispatcher. Records fetched but not sent yet are merged into the next
    /// attempt's result.
    async fn fetch_want(&self, dispatched: DispatchedWant, backoff: &mut Backoff) {
        let DispatchedWant { mut want, results } = dispatched;
        let mut previous = FetchResult::default();

        let mut attempt = 0;
        while backoff.ongoing() && !want.is_complete() {
            let attempt_span = debug_span!("fetch_attempt", attempt);
            let fetched = self.fetch_single(want).instrument(attempt_span).await;
            attempt += 1;

            self.ctx.add_buffered_records(fetched.records.len() as i64);

            let result = fetched.merge(std::mem::take(&mut previous));
            if let Some(err) = &result.error {
                want = self.handle_fetch_err(err, want, backoff).await;
            }
            if result.high_watermark >= 0 {
                self.high_watermark
                    .fetch_max(result.high_watermark, Ordering::AcqRel);
            }

            let Some(last_offset) = result.last_offset() else {
                if self.stop.is_cancelled() {
                    return;
                }
                previous = result;
                continue;
            };

            want.start_offset = last_offset + 1;
            // The merged result gives a better average than the last attempt alone.
            want = want.update_bytes_per_record(result.fetched_bytes, result.records.len());
            // Any record means some success, don't slow down.
            backoff.reset();

            if self.stop.is_cancelled() {
                return;
            }
            match results.try_send(result) {
                Ok(()) => {}
                Err(TrySendError::Full(mut full)) if want.is_complete() => {
                    // Nothing else to fetch for this want; wait for the
                    // dispatcher to take it.
                    full.start_waiting_for_consumption();
                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        sent = results.send(full) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(TrySendError::Full(full)) => previous = full,
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    async fn handle_fetch_err(
        &self,
        err: &BrokerError,
        want: FetchWant,
        backoff: &mut Backoff,
    ) -> FetchWant {
        let (want, policy) = classify_fetch_err(err, want, self.ctx.start_offsets.cached_offset());
        match policy {
            RetryPolicy::RetryNow => {}
            RetryPolicy::WaitForProduce => {
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = tokio::time::sleep(self.ctx.min_bytes_wait_time) => {}
                }
            }
            RetryPolicy::Backoff => backoff.wait().await,
            RetryPolicy::RefreshMetadataAndBackoff => {
                // Refreshing is asynchronous; the backoff gives it time to
                // complete before the next attempt.
                self.ctx.broker.force_metadata_refresh();
                backoff.wait().await;
            }
        }
        want
    }

    /// Sends a single fetch request for `want` to the partition leader.
    ///
    /// The result may hold fewer records than the want asked for. If the
    /// worker is stopped while the request is in flight, the result is empty
    /// and has no error.
    pub(crate) async fn fetch_single(&self, want: FetchWant) -> FetchResult {
        let fetch_start = Instant::now();
        self.ctx.metrics.fetch_requests.inc();

        let result = tokio::select! {
            biased;
            _ = self.stop.cancelled() => FetchResult::empty(Span::current()),
            result = self.fetch_from_leader(want) => result,
        };

        let metrics = &self.ctx.metrics;
        if result.error.is_some() {
            metrics.fetch_errors.inc();
        }
        metrics.fetched_records.inc_by(result.records.len() as u64);
        metrics.fetched_bytes.inc_by(result.fetched_bytes as u64);

        result.log_completed_fetch(fetch_start, &want);
        result
    }

    async fn fetch_from_leader(&self, want: FetchWant) -> FetchResult {
        let span = Span::current();
        let broker = self.ctx.broker.as_ref();
        let leader = match broker.resolve_leader(&self.ctx.topic, self.ctx.partition).await {
            Ok(leader) if leader.broker_id == -1 && leader.epoch == -1 => {
                return FetchResult::from_error(span, BrokerError::UnknownPartitionLeader);
            }
            Ok(leader) => leader,
            Err(err) => {
                return FetchResult::from_error(span, BrokerError::FindingLeader(err.to_string()));
            }
        };

        let request = build_fetch_request(&self.ctx, &want, leader.epoch);
        match broker.fetch(leader.broker_id, request).await {
            Ok(response) => parse_fetch_response(&self.ctx, span, want.start_offset, response),
            Err(err) => FetchResult::from_error(span, err),
        }
    }
}

pub(crate) fn build_fetch_request(
    ctx: &FetchContext,
    want: &FetchWant,
    leader_epoch: i32,
) -> FetchRequest {
    let max_bytes = want.max_bytes();
    FetchRequest {
        // Some brokers ignore this, so the max wait time and max bytes decide
        // how soon they respond.
        min_bytes: 1,
        max_bytes,
        max_wait_millis: ctx.min_bytes_wait_time.as_millis().min(i32::MAX as u128) as i32,
        topic: ctx.topic.clone(),
        topic_id: ctx.topic_id,
        partition: ctx.partition,
        fetch_offset: want.start_offset,
        partition_max_bytes: max_bytes,
        current_leader_epoch: leader_epoch,
    }
}

pub(crate) fn parse_fetch_response(
    ctx: &FetchContext,
    span: Span,
    fetch_offset: i64,
    response: FetchResponse,
) -> FetchResult {
    let Some(topic) = response.topics.into_iter().next().filter(|t| t.topic_id == ctx.topic_id)
    else {
        return FetchResult::from_error(
            span,
            BrokerError::UnexpectedResponse(format!(
                "didn't find expected topic {} in fetch response",
                ctx.topic_id
            )),
        );
    };
    let Some(mut partition) = topic.partitions.into_iter().next() else {
        return FetchResult::from_error(
            span,
            BrokerError::UnexpectedResponse(format!(
                "didn't find expected partition {} in fetch response; received no partitions",
                ctx.partition
            )),
        );
    };
    if partition.partition != ctx.partition {
        return FetchResult::from_error(
            span,
            BrokerError::UnexpectedResponse(format!(
                "didn't find expected partition {} in fetch response; received partition {}",
                ctx.partition, partition.partition
            )),
        );
    }

    // Responses hold whole record batches, which can start before the
    // requested offset.
    partition.records.retain(|record| record.offset >= fetch_offset);

    let fetched_bytes = if ctx.track_compressed_bytes {
        partition.batch_bytes
    } else {
        partition.records.iter().map(|r| r.value.len()).sum()
    };

    FetchResult {
        records: partition.records,
        error: KafkaErrorCode::from_code(partition.error_code).map(BrokerError::Kafka),
        high_watermark: partition.high_watermark,
        log_start_offset: partition.log_start_offset,
        fetched_bytes,
        span,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::broker::{
        FetchResponsePartition, FetchResponseTopic, MockBroker, OffsetSpec, PartitionLeader,
        Record,
    };

    const TOPIC_ID: TopicId = TopicId([7; 16]);

    fn record(offset: i64, size: usize) -> Record {
        Record {
            offset,
            key: None,
            value: vec![0; size],
            timestamp: None,
            headers: Vec::new(),
        }
    }

    fn response(partition: i32, error_code: i16, records: Vec<Record>) -> FetchResponse {
        let batch_bytes = records.len() * 3;
        FetchResponse {
            topics: vec![FetchResponseTopic {
                topic: "ingest".to_string(),
                topic_id: TOPIC_ID,
                partitions: vec![FetchResponsePartition {
                    partition,
                    error_code,
                    high_watermark: 100,
                    log_start_offset: 0,
                    records,
                    batch_bytes,
                }],
            }],
        }
    }

    fn leader(broker: &mut MockBroker) {
        broker.expect_resolve_leader().returning(|_, _| {
            Ok(PartitionLeader {
                broker_id: 2,
                epoch: 5,
            })
        });
    }

    async fn worker(mut broker: MockBroker, track_compressed_bytes: bool) -> FetchWorker {
        broker
            .expect_list_offset()
            .withf(|_, _, spec| *spec == OffsetSpec::Earliest)
            .returning(|_, _, _| Ok(0));
        let broker: Arc<dyn Broker> = Arc::new(broker);
        let start_offsets =
            StartOffsetReader::start(broker.clone(), "ingest".into(), 1, Duration::from_secs(60))
                .await;

        FetchWorker {
            id: 0,
            ctx: Arc::new(FetchContext {
                broker,
                topic: "ingest".to_string(),
                topic_id: TOPIC_ID,
                partition: 1,
                min_bytes_wait_time: Duration::from_millis(500),
                track_compressed_bytes,
                start_offsets,
                metrics: Arc::new(FetcherMetrics::new().unwrap()),
                buffered_records: AtomicI64::new(0),
                buffered_bytes: AtomicI64::new(0),
                estimated_bytes_per_record: AtomicI64::new(0),
            }),
            stop: CancellationToken::new(),
            high_watermark: Arc::new(AtomicI64::new(0)),
        }
    }

    fn want(start_offset: i64, end_offset: i64) -> FetchWant {
        FetchWant {
            start_offset,
            end_offset,
            estimated_bytes_per_record: 10,
            target_max_bytes: 1_000_000,
        }
    }

    fn offsets(result: &FetchResult) -> Vec<i64> {
        result.records.iter().map(|r| r.offset).collect()
    }

    #[tokio::test]
    async fn test_fetch_single_sends_request_to_leader() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker
            .expect_fetch()
            .withf(|broker_id, req| {
                *broker_id == 2
                    && req.min_bytes == 1
                    && req.max_bytes == 1_000_000
                    && req.partition_max_bytes == 1_000_000
                    && req.max_wait_millis == 500
                    && req.topic == "ingest"
                    && req.topic_id == TOPIC_ID
                    && req.partition == 1
                    && req.fetch_offset == 10
                    && req.current_leader_epoch == 5
            })
            .times(1)
            .returning(|_, _| Ok(response(1, 0, (8..13).map(|o| record(o, 4)).collect())));
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(10, 20)).await;
        assert_eq!(result.error, None);
        // Records of the batch before the fetch offset are dropped.
        assert_eq!(offsets(&result), vec![10, 11, 12]);
        assert_eq!(result.fetched_bytes, 12);
        assert_eq!(result.high_watermark, 100);

        let metrics = worker.ctx.metrics.snapshot();
        assert_eq!(metrics.fetch_requests, 1);
        assert_eq!(metrics.fetched_records, 3);
    }

    #[tokio::test]
    async fn test_fetch_single_tracks_compressed_bytes() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker
            .expect_fetch()
            .returning(|_, _| Ok(response(1, 0, (0..4).map(|o| record(o, 100)).collect())));
        let worker = worker(broker, true).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert_eq!(result.fetched_bytes, 12);
    }

    #[tokio::test]
    async fn test_fetch_single_without_leader() {
        let mut broker = MockBroker::new();
        broker.expect_resolve_leader().returning(|_, _| {
            Ok(PartitionLeader {
                broker_id: -1,
                epoch: -1,
            })
        });
        broker.expect_fetch().never();
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert_eq!(result.error, Some(BrokerError::UnknownPartitionLeader));
        assert!(result.records.is_empty());
        assert_eq!(worker.ctx.metrics.snapshot().fetch_errors, 1);
    }

    #[tokio::test]
    async fn test_fetch_single_leader_lookup_error() {
        let mut broker = MockBroker::new();
        broker
            .expect_resolve_leader()
            .returning(|_, _| Err(BrokerError::ConnectionClosed));
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert!(matches!(result.error, Some(BrokerError::FindingLeader(_))));
    }

    #[tokio::test]
    async fn test_fetch_single_rejects_unexpected_partition() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker
            .expect_fetch()
            .returning(|_, _| Ok(response(9, 0, vec![record(0, 1)])));
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert!(matches!(result.error, Some(BrokerError::UnexpectedResponse(_))));
        assert!(result.records.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_single_rejects_unexpected_topic() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker.expect_fetch().returning(|_, _| Ok(FetchResponse::default()));
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert!(matches!(result.error, Some(BrokerError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_fetch_single_maps_error_code() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker
            .expect_fetch()
            .returning(|_, _| Ok(response(1, 6, Vec::new())));
        let worker = worker(broker, false).await;

        let result = worker.fetch_single(want(0, 10)).await;
        assert_eq!(
            result.error,
            Some(BrokerError::Kafka(KafkaErrorCode::NotLeaderForPartition))
        );
    }

    #[tokio::test]
    async fn test_fetch_single_after_stop_is_empty() {
        let mut broker = MockBroker::new();
        broker.expect_resolve_leader().never();
        broker.expect_fetch().never();
        let worker = worker(broker, false).await;
        worker.stop.cancel();

        let result = worker.fetch_single(want(0, 10)).await;
        assert_eq!(result.error, None);
        assert!(result.records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_want_fetched_over_two_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut broker = MockBroker::new();
        leader(&mut broker);
        let calls = attempts.clone();
        broker.expect_fetch().returning(move |_, req| {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(response(1, 0, (0..5).map(|o| record(o, 20)).collect())),
                1 => Err(BrokerError::IoTimeout),
                _ => Ok(response(
                    1,
                    0,
                    (req.fetch_offset..10).map(|o| record(o, 20)).collect(),
                )),
            }
        });
        broker.expect_force_metadata_refresh().times(1).return_const(());
        let worker = worker(broker, false).await;
        let (results_tx, mut results_rx) = mpsc::channel(1);

        let fetching = tokio::spawn(async move {
            let mut backoff = Backoff::new(worker.stop.clone()).unwrap();
            worker
                .fetch_want(
                    DispatchedWant {
                        want: want(0, 10),
                        results: results_tx,
                    },
                    &mut backoff,
                )
                .await;
            worker
        });

        let first = results_rx.recv().await.unwrap();
        assert_eq!(offsets(&first), (0..5).collect::<Vec<_>>());
        let second = results_rx.recv().await.unwrap();
        assert_eq!(offsets(&second), (5..10).collect::<Vec<_>>());
        // The want is retired once everything was sent.
        assert!(results_rx.recv().await.is_none());

        let worker = fetching.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(worker.ctx.buffered_records.load(Ordering::Relaxed), 10);
        assert_eq!(worker.high_watermark.load(Ordering::Relaxed), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_want_keeps_unsent_records() {
        let mut broker = MockBroker::new();
        leader(&mut broker);
        broker.expect_fetch().returning(|_, req| {
            let end = (req.fetch_offset + 2).min(6);
            Ok(response(1, 0, (req.fetch_offset..end).map(|o| record(o, 1)).collect()))
        });
        let worker = worker(broker, false).await;
        let (results_tx, mut results_rx) = mpsc::channel(1);

        let mut backoff = Backoff::new(worker.stop.clone()).unwrap();
        let fetching = worker.fetch_want(
            DispatchedWant {
                want: want(0, 6),
                results: results_tx,
            },
            &mut backoff,
        );
        let receiving = async {
            // Only start receiving once the worker had to hold records back.
            tokio::time::sleep(Duration::from_millis(1)).await;
            let mut received = Vec::new();
            while let Some(result) = results_rx.recv().await {
                received.push(offsets(&result));
            }
            received
        };
        let ((), received) = tokio::join!(fetching, receiving);

        // The first result fills the channel, the second is held back and
        // merged with the third, which is sent once the channel has room.
        assert_eq!(received, vec![vec![0, 1], vec![2, 3, 4, 5]]);
    }
}
