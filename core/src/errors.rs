use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetcher error: {0}")]
    Fetcher(#[from] FetcherError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors raised while setting up a partition fetcher. Once running, the
/// fetcher never fails: broker errors are retried until it is stopped.
#[derive(Error, Debug)]
pub enum FetcherError {
    #[error("resolving offset to start consuming from: {0}")]
    ResolveStartOffset(#[source] BrokerError),

    #[error("failed to find topic ID: topic {topic} not found")]
    TopicNotFound { topic: String },

    #[error("failed to find topic ID for {topic}: {source}")]
    TopicMetadata {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("fetch concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("invalid fetcher config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// A condition reported by the broker capability, either as a protocol
/// error code on the fetched partition or as a client-side failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("{0}")]
    Kafka(KafkaErrorCode),

    #[error("unknown partition leader")]
    UnknownPartitionLeader,

    #[error("finding leader for partition: {0}")]
    FindingLeader(String),

    #[error("unknown broker {0}")]
    UnknownBroker(i32),

    #[error("the broker chosen to issue this request has died")]
    BrokerDied,

    #[error("use of closed network connection")]
    ConnectionClosed,

    #[error("first read from broker returned EOF")]
    FirstReadEof,

    #[error("i/o timeout")]
    IoTimeout,

    #[error("unexpected fetch response: {0}")]
    UnexpectedResponse(String),

    #[error("partition start offset has not been fetched yet")]
    StartOffsetUnavailable,

    #[error("broker client error: {0}")]
    Client(String),
}

/// Kafka protocol error codes the fetcher knows how to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KafkaErrorCode {
    OffsetOutOfRange,
    UnknownTopicOrPartition,
    LeaderNotAvailable,
    NotLeaderForPartition,
    RequestTimedOut,
    BrokerNotAvailable,
    ReplicaNotAvailable,
    TopicAuthorizationFailed,
    UnsupportedVersion,
    KafkaStorageError,
    FencedLeaderEpoch,
    UnknownLeaderEpoch,
    UnsupportedCompressionType,
    UnknownTopicId,
    OffsetMovedToTieredStorage,
    Other(i16),
}

impl KafkaErrorCode {
    /// Maps a wire error code. Returns `None` for `0` (no error).
    pub fn from_code(code: i16) -> Option<Self> {
        let known = match code {
            0 => return None,
            1 => Self::OffsetOutOfRange,
            3 => Self::UnknownTopicOrPartition,
            5 => Self::LeaderNotAvailable,
            6 => Self::NotLeaderForPartition,
            7 => Self::RequestTimedOut,
            8 => Self::BrokerNotAvailable,
            9 => Self::ReplicaNotAvailable,
            29 => Self::TopicAuthorizationFailed,
            35 => Self::UnsupportedVersion,
            56 => Self::KafkaStorageError,
            74 => Self::FencedLeaderEpoch,
            75 => Self::UnknownLeaderEpoch,
            76 => Self::UnsupportedCompressionType,
            100 => Self::UnknownTopicId,
            109 => Self::OffsetMovedToTieredStorage,
            other => Self::Other(other),
        };
        Some(known)
    }

    pub fn code(&self) -> i16 {
        match self {
            Self::OffsetOutOfRange => 1,
            Self::UnknownTopicOrPartition => 3,
            Self::LeaderNotAvailable => 5,
            Self::NotLeaderForPartition => 6,
            Self::RequestTimedOut => 7,
            Self::BrokerNotAvailable => 8,
            Self::ReplicaNotAvailable => 9,
            Self::TopicAuthorizationFailed => 29,
            Self::UnsupportedVersion => 35,
            Self::KafkaStorageError => 56,
            Self::FencedLeaderEpoch => 74,
            Self::UnknownLeaderEpoch => 75,
            Self::UnsupportedCompressionType => 76,
            Self::UnknownTopicId => 100,
            Self::OffsetMovedToTieredStorage => 109,
            Self::Other(code) => *code,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::OffsetOutOfRange => "OFFSET_OUT_OF_RANGE",
            Self::UnknownTopicOrPartition => "UNKNOWN_TOPIC_OR_PARTITION",
            Self::LeaderNotAvailable => "LEADER_NOT_AVAILABLE",
            Self::NotLeaderForPartition => "NOT_LEADER_FOR_PARTITION",
            Self::RequestTimedOut => "REQUEST_TIMED_OUT",
            Self::BrokerNotAvailable => "BROKER_NOT_AVAILABLE",
            Self::ReplicaNotAvailable => "REPLICA_NOT_AVAILABLE",
            Self::TopicAuthorizationFailed => "TOPIC_AUTHORIZATION_FAILED",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::KafkaStorageError => "KAFKA_STORAGE_ERROR",
            Self::FencedLeaderEpoch => "FENCED_LEADER_EPOCH",
            Self::UnknownLeaderEpoch => "UNKNOWN_LEADER_EPOCH",
            Self::UnsupportedCompressionType => "UNSUPPORTED_COMPRESSION_TYPE",
            Self::UnknownTopicId => "UNKNOWN_TOPIC_ID",
            Self::OffsetMovedToTieredStorage => "OFFSET_MOVED_TO_TIERED_STORAGE",
            Self::Other(_) => "UNKNOWN_SERVER_ERROR",
        }
    }
}

impl fmt::Display for KafkaErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.name(), self.code())
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write batch: {reason}")]
    Write { reason: String },

    #[error("Failed to flush: {reason}")]
    Flush { reason: String },
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl IngestionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Sink(SinkError::Write { .. }) => true,
            IngestionError::Sink(SinkError::Flush { .. }) => true,
            IngestionError::Broker(_) => true,
            IngestionError::Config(_) => false,
            IngestionError::Fetcher(_) => false,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            IngestionError::Broker(_) => 1000,
            IngestionError::Sink(_) => 2000,
            _ => 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_both_ways() {
        for code in [1, 3, 5, 6, 7, 8, 9, 29, 35, 56, 74, 75, 76, 100, 109, 42] {
            let parsed = KafkaErrorCode::from_code(code).expect("non-zero code");
            assert_eq!(parsed.code(), code);
        }
        assert_eq!(KafkaErrorCode::from_code(0), None);
        assert_eq!(KafkaErrorCode::from_code(42), Some(KafkaErrorCode::Other(42)));
    }

    #[test]
    fn test_broker_error_display() {
        let err = BrokerError::Kafka(KafkaErrorCode::NotLeaderForPartition);
        assert_eq!(err.to_string(), "NOT_LEADER_FOR_PARTITION (code 6)");
    }

    #[test]
    fn test_error_types() {
        let broker_error = IngestionError::Broker(BrokerError::IoTimeout);
        assert!(broker_error.is_retryable());
        assert_eq!(broker_error.get_retry_delay_ms(), 1000);

        let config_error = IngestionError::Config(ConfigError::ValidationFailed {
            reason: "Invalid field".to_string(),
        });
        assert!(!config_error.is_retryable());
        assert_eq!(config_error.get_retry_delay_ms(), 5000);

        let sink_error = IngestionError::from(SinkError::Flush {
            reason: "disk full".to_string(),
        });
        assert!(sink_error.is_retryable());
        assert_eq!(sink_error.get_retry_delay_ms(), 2000);

        let fetcher_error = IngestionError::from(FetcherError::InvalidConfig(
            ConfigError::Invalid {
                message: "start offset -1 is negative".to_string(),
            },
        ));
        assert!(!fetcher_error.is_retryable());
    }
}
