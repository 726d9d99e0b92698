use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub kafka: KafkaOptions,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topic: String,
    pub partition: i32,
    pub consumer_group: String,
    pub client_id: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

/// Where a fetcher starts consuming when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// The oldest offset still retained by the partition.
    Earliest,
    /// The offset the next produced record will get; existing records are skipped.
    Latest,
    /// A specific offset, typically the last offset the consumer committed plus one.
    At(i64),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Number of parallel fetch workers.
    pub concurrency: usize,
    /// Upper bound of fetched but not yet consumed bytes. Zero or negative
    /// means unbounded.
    pub max_buffered_bytes: i64,
    /// Size requests by the compressed on-wire bytes of previous responses
    /// instead of the decoded record sizes.
    pub track_compressed_bytes: bool,
    /// How long the broker may hold a fetch request waiting for data.
    pub min_bytes_wait_time_ms: u64,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub start_offset: StartOffset,
    /// How often the partition start offset is re-read from the broker.
    pub start_offset_refresh_interval_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_buffered_bytes: 100_000_000,
            track_compressed_bytes: false,
            min_bytes_wait_time_ms: 5000,
            start_offset: StartOffset::Earliest,
            start_offset_refresh_interval_ms: 1000,
        }
    }
}

impl FetcherConfig {
    /// The buffered bytes limit as used by the dispatcher: clamped to
    /// `i32::MAX`, which is also what a non-positive limit turns into.
    pub fn max_buffered_bytes_limit(&self) -> i32 {
        if self.max_buffered_bytes <= 0 {
            return i32::MAX;
        }
        self.max_buffered_bytes.min(i32::MAX as i64) as i32
    }

    pub fn min_bytes_wait_time(&self) -> Duration {
        Duration::from_millis(self.min_bytes_wait_time_ms)
    }

    pub fn start_offset_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.start_offset_refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "fetcher concurrency must be at least 1".to_string(),
            });
        }
        if self.min_bytes_wait_time_ms > i32::MAX as u64 {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "min_bytes_wait_time_ms must not exceed {} milliseconds",
                    i32::MAX
                ),
            });
        }
        if self.start_offset_refresh_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "start_offset_refresh_interval_ms must be positive".to_string(),
            });
        }
        if let StartOffset::At(offset) = self.start_offset {
            if offset < 0 {
                return Err(ConfigError::Invalid {
                    message: format!("start offset {offset} is negative"),
                });
            }
        }
        Ok(())
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<IngestConfig, ConfigError> {
    match config_path {
        Some(path) => IngestConfig::from_file(path),
        None => IngestConfig::from_env(),
    }
}

impl IngestConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(path, &content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var("INGEST_CONFIG").map_err(|_| ConfigError::MissingField {
            field: "INGEST_CONFIG environment variable".to_string(),
        })?;
        Self::from_yaml("INGEST_CONFIG", &config_str)
    }

    fn from_yaml(origin: &str, content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Kafka bootstrap servers cannot be empty".to_string(),
            });
        }
        if self.kafka.topic.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "Kafka topic cannot be empty".to_string(),
            });
        }
        if self.kafka.partition < 0 {
            return Err(ConfigError::ValidationFailed {
                reason: format!("Kafka partition {} is negative", self.kafka.partition),
            });
        }
        self.fetcher.validate()
    }
}
