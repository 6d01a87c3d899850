//! Error types for sift-tracking

use thiserror::Error;

/// Errors raised by tracking backends.
#[derive(Error, Debug)]
pub enum TrackingError {
    /// Backend could not persist a record
    #[error("tracking write failed: {0}")]
    Write(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("tracking serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend refused the record (e.g. disabled or unreachable)
    #[error("tracking backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for tracking operations
pub type TrackingResult<T> = std::result::Result<T, TrackingError>;
