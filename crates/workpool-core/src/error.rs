//! Error types for the workpool core library.

use thiserror::Error;

/// Result type alias using the workpool core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by the wire codecs and configuration loader.
#[derive(Debug, Error)]
pub enum Error {
    /// A worker message could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
