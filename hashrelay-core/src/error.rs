//! Error types for hashrelay-core

use thiserror::Error;

/// Main error type for the hashrelay-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the collector (timeout, DNS, refused)
    #[error("network error: {0}")]
    Network(String),

    /// The collector answered, but not in the shape we expect
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Payload encryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Record rejected before it reached the queue
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Result type alias for hashrelay-core
pub type Result<T> = std::result::Result<T, Error>;
