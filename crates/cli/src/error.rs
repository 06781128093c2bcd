//! CLI error types.

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The database file does not exist.
    ///
    /// This typically means no conversation has been started yet.
    #[error("database not found at {path}. Run 'skein chat' first")]
    DatabaseNotFound { path: PathBuf },

    /// No conversation was found matching the given prefix.
    #[error("no conversation found matching '{prefix}'")]
    ConversationNotFound { prefix: String },

    /// Multiple conversations match the given prefix.
    ///
    /// The user should provide a longer prefix to disambiguate.
    #[error("multiple conversations match '{prefix}': {matches:?}")]
    AmbiguousConversation {
        prefix: String,
        matches: Vec<String>,
    },

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// Configuration is invalid or missing required fields.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// An error occurred in the storage layer.
    #[error(transparent)]
    Storage(#[from] storage::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
