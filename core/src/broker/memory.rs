//! An in-process, single-partition log that behaves like a Kafka broker as
//! far as the fetcher can tell.
//!
//! Used by the integration tests and for dry runs of the ingestor without a
//! cluster. Besides serving fetches it can inject faults, delay responses and
//! delete records the way retention would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::broker::{
    Broker, FetchRequest, FetchResponse, FetchResponsePartition, FetchResponseTopic, OffsetSpec,
    PartitionLeader, Record, TopicId, TopicMetadata,
};
use crate::errors::{BrokerError, KafkaErrorCode};

/// Bytes a record adds to its batch on top of its key and value.
const RECORD_OVERHEAD_BYTES: usize = 20;

type FetchDelay = Arc<dyn Fn(&FetchRequest) -> Duration + Send + Sync>;

#[derive(Debug, Default)]
struct PartitionLog {
    log_start_offset: i64,
    records: VecDeque<Record>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.log_start_offset + self.records.len() as i64
    }
}

pub struct InMemoryBroker {
    topic: String,
    topic_id: TopicId,
    partition: i32,
    leader: Mutex<PartitionLeader>,
    log: Mutex<PartitionLog>,
    /// Broadcasts the high watermark to fetches waiting for new records.
    produced: watch::Sender<i64>,
    /// One-shot faults, keyed by the fetch offset they fail.
    faults: Mutex<HashMap<i64, VecDeque<BrokerError>>>,
    fetch_delay: Mutex<Option<FetchDelay>>,
    /// Responses start at a multiple of this offset, like record batches do.
    batch_size: Mutex<i64>,
    fetch_requests: AtomicUsize,
    metadata_refreshes: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        let mut id = [0u8; 16];
        for (i, byte) in topic.bytes().enumerate() {
            id[i % 16] ^= byte;
        }
        id[15] |= 1;
        let (produced, _) = watch::channel(0);

        Self {
            topic,
            topic_id: TopicId(id),
            partition,
            leader: Mutex::new(PartitionLeader {
                broker_id: 1,
                epoch: 0,
            }),
            log: Mutex::new(PartitionLog::default()),
            produced,
            faults: Mutex::new(HashMap::new()),
            fetch_delay: Mutex::new(None),
            batch_size: Mutex::new(1),
            fetch_requests: AtomicUsize::new(0),
            metadata_refreshes: AtomicUsize::new(0),
        }
    }

    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    /// Appends a record and returns its offset.
    pub fn produce(&self, value: impl Into<Vec<u8>>) -> i64 {
        let mut log = lock(&self.log);
        let offset = log.high_watermark();
        log.records.push_back(Record {
            offset,
            key: None,
            value: value.into(),
            timestamp: Some(Utc::now()),
            headers: Vec::new(),
        });
        self.produced.send_replace(log.high_watermark());
        offset
    }

    /// Appends `count` records with values of `value_size` bytes.
    pub fn produce_many(&self, count: usize, value_size: usize) {
        for _ in 0..count {
            self.produce(vec![b'x'; value_size]);
        }
    }

    /// Deletes every record below `offset`, as retention would.
    pub fn truncate(&self, offset: i64) {
        let mut log = lock(&self.log);
        while log.log_start_offset < offset {
            if log.records.pop_front().is_none() {
                break;
            }
            log.log_start_offset += 1;
        }
    }

    pub fn high_watermark(&self) -> i64 {
        lock(&self.log).high_watermark()
    }

    /// Makes the next fetch starting at `fetch_offset` fail with `err`.
    /// Protocol errors are returned in the response, anything else fails
    /// the request.
    pub fn fail_next_fetch_at(&self, fetch_offset: i64, err: BrokerError) {
        lock(&self.faults)
            .entry(fetch_offset)
            .or_default()
            .push_back(err);
    }

    /// Delays every fetch response by what `delay` returns for the request.
    pub fn set_fetch_delay<F>(&self, delay: F)
    where
        F: Fn(&FetchRequest) -> Duration + Send + Sync + 'static,
    {
        *lock(&self.fetch_delay) = Some(Arc::new(delay));
    }

    pub fn set_batch_size(&self, batch_size: i64) {
        *lock(&self.batch_size) = batch_size.max(1);
    }

    pub fn set_leader(&self, leader: PartitionLeader) {
        *lock(&self.leader) = leader;
    }

    pub fn fetch_requests(&self) -> usize {
        self.fetch_requests.load(Ordering::Relaxed)
    }

    pub fn metadata_refreshes(&self) -> usize {
        self.metadata_refreshes.load(Ordering::Relaxed)
    }

    fn partition_response(&self, request: &FetchRequest) -> FetchResponsePartition {
        let log = lock(&self.log);
        let mut response = FetchResponsePartition {
            partition: self.partition,
            high_watermark: log.high_watermark(),
            log_start_offset: log.log_start_offset,
            ..Default::default()
        };
        if request.fetch_offset < log.log_start_offset || request.fetch_offset > log.high_watermark()
        {
            response.error_code = KafkaErrorCode::OffsetOutOfRange.code();
            return response;
        }

        let batch_size = *lock(&self.batch_size);
        let first = (request.fetch_offset - request.fetch_offset % batch_size).max(log.log_start_offset);
        let max_bytes = request.partition_max_bytes.max(1) as usize;
        let mut value_bytes = 0;
        for record in log.records.iter().skip((first - log.log_start_offset) as usize) {
            value_bytes += record.value.len();
            if value_bytes > max_bytes && !response.records.is_empty() {
                break;
            }
            response.batch_bytes += RECORD_OVERHEAD_BYTES
                + record.value.len()
                + record.key.as_ref().map_or(0, Vec::len);
            response.records.push(record.clone());
        }
        response
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn resolve_leader(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<PartitionLeader, BrokerError> {
        if topic != self.topic || partition != self.partition {
            return Err(BrokerError::Kafka(KafkaErrorCode::UnknownTopicOrPartition));
        }
        Ok(*lock(&self.leader))
    }

    async fn fetch(
        &self,
        broker_id: i32,
        request: FetchRequest,
    ) -> Result<FetchResponse, BrokerError> {
        self.fetch_requests.fetch_add(1, Ordering::Relaxed);
        if broker_id != lock(&self.leader).broker_id {
            return Err(BrokerError::UnknownBroker(broker_id));
        }

        let delay = lock(&self.fetch_delay).clone();
        if let Some(delay) = delay {
            tokio::time::sleep(delay(&request)).await;
        }

        let mut partition = FetchResponsePartition {
            partition: request.partition,
            ..Default::default()
        };
        let fault = lock(&self.faults)
            .get_mut(&request.fetch_offset)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(BrokerError::Kafka(code)) => {
                partition.error_code = code.code();
            }
            Some(err) => return Err(err),
            None if request.topic_id != self.topic_id || request.partition != self.partition => {
                partition.error_code = KafkaErrorCode::UnknownTopicId.code();
            }
            None => {
                // Long polling: hold the request until something is produced
                // past the fetch offset or the max wait time is up.
                let mut produced = self.produced.subscribe();
                let wait = Duration::from_millis(request.max_wait_millis.max(0) as u64);
                let _ = tokio::time::timeout(
                    wait,
                    produced.wait_for(|hwm| *hwm != request.fetch_offset),
                )
                .await;
                partition = self.partition_response(&request);
            }
        }

        Ok(FetchResponse {
            topics: vec![FetchResponseTopic {
                topic: request.topic.clone(),
                topic_id: request.topic_id,
                partitions: vec![partition],
            }],
        })
    }

    async fn list_topics(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, BrokerError> {
        Ok(topics
            .iter()
            .filter(|name| **name == self.topic)
            .map(|name| TopicMetadata {
                name: name.clone(),
                id: self.topic_id,
                partitions: self.partition + 1,
                error: None,
            })
            .collect())
    }

    async fn list_offset(
        &self,
        topic: &str,
        partition: i32,
        spec: OffsetSpec,
    ) -> Result<i64, BrokerError> {
        if topic != self.topic || partition != self.partition {
            return Err(BrokerError::Kafka(KafkaErrorCode::UnknownTopicOrPartition));
        }
        let log = lock(&self.log);
        Ok(match spec {
            OffsetSpec::Earliest => log.log_start_offset,
            OffsetSpec::Latest => log.high_watermark(),
        })
    }

    fn force_metadata_refresh(&self) {
        self.metadata_refreshes.fetch_add(1, Ordering::Relaxed);
    }
}

/// The broker state stays consistent across a panicking holder, so a
/// poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
