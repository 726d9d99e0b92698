//! The narrow broker capability the fetcher is built on.
//!
//! The fetcher never talks a wire protocol itself. Everything it needs from a
//! Kafka-like broker is expressed by [`Broker`]: find the partition leader,
//! send a single fetch request to it, look up topics and partition offsets,
//! and ask the client to refresh its cluster metadata.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::BrokerError;

/// Kafka topic IDs are 16 byte UUIDs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TopicId(pub [u8; 16]);

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub broker_id: i32,
    /// Leadership term of the broker; `-1` when the client doesn't know it.
    pub epoch: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub max_wait_millis: i32,
    pub topic: String,
    pub topic_id: TopicId,
    pub partition: i32,
    pub fetch_offset: i64,
    pub partition_max_bytes: i32,
    pub current_leader_epoch: i32,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub topics: Vec<FetchResponseTopic>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponseTopic {
    pub topic: String,
    pub topic_id: TopicId,
    pub partitions: Vec<FetchResponsePartition>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponsePartition {
    pub partition: i32,
    /// Protocol error code, `0` when the fetch succeeded.
    pub error_code: i16,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub records: Vec<Record>,
    /// Size of the record batches as they were sent on the wire.
    pub batch_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub id: TopicId,
    pub partitions: i32,
    pub error: Option<BrokerError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// The oldest offset still retained.
    Earliest,
    /// The offset the next produced record will get.
    Latest,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn resolve_leader(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<PartitionLeader, BrokerError>;

    /// Sends a single fetch request to the given broker. Cancelling the
    /// returned future abandons the request.
    async fn fetch(
        &self,
        broker_id: i32,
        request: FetchRequest,
    ) -> Result<FetchResponse, BrokerError>;

    async fn list_topics(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, BrokerError>;

    async fn list_offset(
        &self,
        topic: &str,
        partition: i32,
        spec: OffsetSpec,
    ) -> Result<i64, BrokerError>;

    /// Asks the client to refresh its cluster metadata in the background.
    /// Safe to call from many tasks at once.
    fn force_metadata_refresh(&self);
}
