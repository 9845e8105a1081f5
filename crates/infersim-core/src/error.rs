//! Error types for the infersim simulation core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Workload error at row {row}: {reason}")]
    WorkloadError { row: usize, reason: String },

    #[error("Latency model error: {0}")]
    LatencyModelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Policy bundle parse error: {0}")]
    PolicyBundleError(#[from] serde_yaml::Error),

    #[error("Trace parse error: {0}")]
    TraceError(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
