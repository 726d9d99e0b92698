//! [`Broker`] implemented over librdkafka.
//!
//! librdkafka doesn't expose single fetch requests, so a fetch assigns a
//! dedicated consumer to the partition at the fetch offset and polls it until
//! enough bytes arrived or the max wait time is up. Consumers are pooled so
//! concurrent fetches don't share an assignment. All librdkafka calls block
//! and run on the blocking thread pool.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::broker::{
    Broker, FetchRequest, FetchResponse, FetchResponsePartition, FetchResponseTopic, OffsetSpec,
    PartitionLeader, Record, TopicId, TopicMetadata,
};
use crate::config::KafkaOptions;
use crate::errors::{BrokerError, KafkaErrorCode};

/// Timeout of metadata and offset requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to keep polling for more records once some arrived.
const FOLLOW_UP_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Bytes a record adds to its batch on top of its key and value.
const RECORD_OVERHEAD_BYTES: usize = 20;

pub struct RdKafkaBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    /// Used for metadata and offset requests only; never assigned.
    metadata: BaseConsumer,
    idle_consumers: Mutex<Vec<BaseConsumer>>,
    leaders: Mutex<HashMap<(String, i32), PartitionLeader>>,
}

impl RdKafkaBroker {
    pub fn new(options: &KafkaOptions) -> anyhow::Result<Self> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &options.bootstrap_servers)
            .set("group.id", &options.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            // Out of range offsets are reported instead of silently reset.
            .set("auto.offset.reset", "error");

        if let Some(client_id) = &options.client_id {
            config.set("client.id", client_id);
        }
        if let Some(security_protocol) = &options.security_protocol {
            config.set("security.protocol", security_protocol);
        }
        if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
            config.set("sasl.mechanisms", sasl_mechanisms);
        }
        if let Some(sasl_username) = &options.sasl_username {
            config.set("sasl.username", sasl_username);
        }
        if let Some(sasl_password) = &options.sasl_password {
            config.set("sasl.password", sasl_password);
        }
        if let Some(ssl_ca_location) = &options.ssl_ca_location {
            config.set("ssl.ca.location", ssl_ca_location);
        }

        let metadata: BaseConsumer = config
            .create()
            .context("Failed to create Kafka metadata client")?;
        info!(
            bootstrap_servers = %options.bootstrap_servers,
            "created Kafka broker client"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                metadata,
                idle_consumers: Mutex::new(Vec::new()),
                leaders: Mutex::new(HashMap::new()),
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BrokerError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, BrokerError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| BrokerError::Client(format!("blocking Kafka call failed: {e}")))?
    }
}

impl Inner {
    fn checkout_consumer(&self) -> Result<BaseConsumer, BrokerError> {
        if let Some(consumer) = lock(&self.idle_consumers).pop() {
            return Ok(consumer);
        }
        self.config.create().map_err(map_kafka_error)
    }

    fn checkin_consumer(&self, consumer: BaseConsumer) {
        lock(&self.idle_consumers).push(consumer);
    }

    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponsePartition, BrokerError> {
        let consumer = self.checkout_consumer()?;
        let response = fetch_with(&consumer, request);
        // A consumer left assigned would keep prefetching in the background.
        let unassigned = consumer.unassign();
        if unassigned.is_ok() {
            self.checkin_consumer(consumer);
        }
        response
    }
}

fn fetch_with(
    consumer: &BaseConsumer,
    request: &FetchRequest,
) -> Result<FetchResponsePartition, BrokerError> {
    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(
            &request.topic,
            request.partition,
            Offset::Offset(request.fetch_offset),
        )
        .map_err(map_kafka_error)?;
    consumer.assign(&assignment).map_err(map_kafka_error)?;

    let max_bytes = request.partition_max_bytes.max(1) as usize;
    let deadline = Instant::now() + Duration::from_millis(request.max_wait_millis.max(0) as u64);
    let mut partition = FetchResponsePartition {
        partition: request.partition,
        ..Default::default()
    };
    let mut value_bytes = 0;

    while value_bytes < max_bytes {
        let timeout = if partition.records.is_empty() {
            deadline.saturating_duration_since(Instant::now())
        } else {
            FOLLOW_UP_POLL_TIMEOUT
        };
        if timeout.is_zero() {
            break;
        }
        match consumer.poll(timeout) {
            None => {
                if !partition.records.is_empty() {
                    break;
                }
            }
            Some(Ok(message)) => {
                let record = to_record(&message);
                value_bytes += record.value.len();
                partition.batch_bytes += RECORD_OVERHEAD_BYTES
                    + record.value.len()
                    + record.key.as_ref().map_or(0, Vec::len);
                partition.records.push(record);
            }
            Some(Err(err)) => match map_kafka_error(err) {
                BrokerError::Kafka(code) => {
                    partition.error_code = code.code();
                    break;
                }
                _ if !partition.records.is_empty() => break,
                other => return Err(other),
            },
        }
    }

    let (low, high) = consumer
        .get_watermark_offsets(&request.topic, request.partition)
        .unwrap_or((-1, -1));
    partition.log_start_offset = low;
    partition.high_watermark = high;
    Ok(partition)
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    Record {
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        headers,
    }
}

/// librdkafka doesn't expose topic IDs, so a stable ID is derived from the
/// topic name. It is only ever compared with IDs from this same client.
fn topic_id(topic: &str) -> TopicId {
    let mut id = [0u8; 16];
    for (seed, chunk) in id.chunks_mut(8).enumerate() {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        topic.hash(&mut hasher);
        chunk.copy_from_slice(&hasher.finish().to_be_bytes());
    }
    TopicId(id)
}

fn map_error_code(code: RDKafkaErrorCode) -> Option<BrokerError> {
    use RDKafkaErrorCode as Rd;

    let kafka = |code| Some(BrokerError::Kafka(code));
    match code {
        Rd::OffsetOutOfRange | Rd::AutoOffsetReset => kafka(KafkaErrorCode::OffsetOutOfRange),
        Rd::UnknownTopicOrPartition | Rd::UnknownTopic | Rd::UnknownPartition => {
            kafka(KafkaErrorCode::UnknownTopicOrPartition)
        }
        Rd::LeaderNotAvailable => kafka(KafkaErrorCode::LeaderNotAvailable),
        Rd::NotLeaderForPartition => kafka(KafkaErrorCode::NotLeaderForPartition),
        Rd::RequestTimedOut => kafka(KafkaErrorCode::RequestTimedOut),
        // Losing the brokers is retried after a metadata refresh and a backoff,
        // not right away.
        Rd::BrokerNotAvailable | Rd::BrokerTransportFailure | Rd::AllBrokersDown => {
            kafka(KafkaErrorCode::BrokerNotAvailable)
        }
        Rd::ReplicaNotAvailable => kafka(KafkaErrorCode::ReplicaNotAvailable),
        Rd::TopicAuthorizationFailed => kafka(KafkaErrorCode::TopicAuthorizationFailed),
        Rd::UnsupportedVersion => kafka(KafkaErrorCode::UnsupportedVersion),
        Rd::KafkaStorageError => kafka(KafkaErrorCode::KafkaStorageError),
        Rd::FencedLeaderEpoch => kafka(KafkaErrorCode::FencedLeaderEpoch),
        Rd::UnknownLeaderEpoch => kafka(KafkaErrorCode::UnknownLeaderEpoch),
        Rd::UnsupportedCompressionType => kafka(KafkaErrorCode::UnsupportedCompressionType),
        Rd::OperationTimedOut => Some(BrokerError::IoTimeout),
        _ => None,
    }
}

fn map_kafka_error(err: KafkaError) -> BrokerError {
    err.rdkafka_error_code()
        .and_then(map_error_code)
        .unwrap_or_else(|| BrokerError::Client(err.to_string()))
}

#[async_trait]
impl Broker for RdKafkaBroker {
    async fn resolve_leader(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<PartitionLeader, BrokerError> {
        let key = (topic.to_string(), partition);
        let cached = lock(&self.inner.leaders).get(&key).copied();
        if let Some(leader) = cached {
            return Ok(leader);
        }

        self.blocking(move |inner| {
            let metadata = inner
                .metadata
                .fetch_metadata(Some(key.0.as_str()), REQUEST_TIMEOUT)
                .map_err(map_kafka_error)?;
            let leader = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == key.0)
                .flat_map(|t| t.partitions())
                .find(|p| p.id() == key.1)
                .map(|p| PartitionLeader {
                    broker_id: p.leader(),
                    // Not exposed by librdkafka.
                    epoch: -1,
                })
                .unwrap_or(PartitionLeader {
                    broker_id: -1,
                    epoch: -1,
                });
            if leader.broker_id >= 0 {
                lock(&inner.leaders).insert(key, leader);
            }
            Ok(leader)
        })
        .await
    }

    async fn fetch(
        &self,
        _broker_id: i32,
        request: FetchRequest,
    ) -> Result<FetchResponse, BrokerError> {
        // librdkafka routes the request to the leader itself. If this future
        // is dropped the blocking fetch still runs until its max wait time.
        let topic = request.topic.clone();
        let partition = self.blocking(move |inner| inner.fetch(&request)).await?;
        Ok(FetchResponse {
            topics: vec![FetchResponseTopic {
                topic_id: topic_id(&topic),
                topic,
                partitions: vec![partition],
            }],
        })
    }

    async fn list_topics(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, BrokerError> {
        let topics = topics.to_vec();
        self.blocking(move |inner| {
            let mut result = Vec::with_capacity(topics.len());
            for topic in &topics {
                let metadata = inner
                    .metadata
                    .fetch_metadata(Some(topic.as_str()), REQUEST_TIMEOUT)
                    .map_err(map_kafka_error)?;
                for t in metadata.topics().iter().filter(|t| t.name() == topic.as_str()) {
                    result.push(TopicMetadata {
                        name: t.name().to_string(),
                        id: topic_id(t.name()),
                        partitions: t.partitions().len() as i32,
                        error: t.error().map(|err| {
                            let code = RDKafkaErrorCode::from(err);
                            map_error_code(code)
                                .unwrap_or_else(|| BrokerError::Client(code.to_string()))
                        }),
                    });
                }
            }
            Ok(result)
        })
        .await
    }

    async fn list_offset(
        &self,
        topic: &str,
        partition: i32,
        spec: OffsetSpec,
    ) -> Result<i64, BrokerError> {
        let topic = topic.to_string();
        let (low, high) = self
            .blocking(move |inner| {
                inner
                    .metadata
                    .fetch_watermarks(&topic, partition, REQUEST_TIMEOUT)
                    .map_err(map_kafka_error)
            })
            .await?;
        Ok(match spec {
            OffsetSpec::Earliest => low,
            OffsetSpec::Latest => high,
        })
    }

    fn force_metadata_refresh(&self) {
        // Leaders are looked up again on the next fetch.
        lock(&self.inner.leaders).clear();
        debug!("cleared cached partition leaders");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
