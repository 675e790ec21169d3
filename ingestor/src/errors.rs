use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lock contention or temporary unavailability reported by the store.
    #[error("Transient store timeout: {0}")]
    TransientTimeout(String),

    #[error("Commit failed after {attempts} attempts: {source}")]
    CommitFailure {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Only store timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
