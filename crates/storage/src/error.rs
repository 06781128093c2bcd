use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Runtime-only events (execute, end, metric, error, interrupt) never
    /// reach the log.
    #[error("event type '{0}' is not durable")]
    NotDurable(&'static str),

    #[error("invalid stored row {seq}: {reason}")]
    InvalidRow { seq: i64, reason: String },

    #[error("store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, Error>;
