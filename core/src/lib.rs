pub mod broker;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use errors::{IngestionError, Result};
