use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether a failed model pass may be retried.
    ///
    /// Store, configuration and state errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Transport(_) | Self::Provider(_) | Self::Io(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Api { status: 529, message: "overloaded".into() }.is_retryable());
        assert!(Error::Api { status: 429, message: "slow down".into() }.is_retryable());
        assert!(!Error::Api { status: 400, message: "bad".into() }.is_retryable());
        assert!(!Error::Storage(storage::Error::Poisoned).is_retryable());
        assert!(!Error::Config("x".into()).is_retryable());
    }
}
