use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A partition answered with a non-success status.
    #[error("Partition {endpoint} answered with status {status}")]
    PartitionUnavailable { endpoint: String, status: u16 },

    #[error("Partition transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("No partitions registered for {0}")]
    NoPartitions(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Report publish failed: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
