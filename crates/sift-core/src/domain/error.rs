//! Error taxonomy for sift.
//!
//! The first five variants are the caller-visible failure classes of the
//! curation pipeline; the rest wrap infrastructure errors.

use crate::domain::stage::Stage;

/// Sift domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CurationError {
    /// Bad input, reported before any I/O happens.
    #[error("invalid parameter {field}: {reason}")]
    InvalidParameter { field: String, reason: String },

    /// On-disk cache entry disagrees with its manifest.
    #[error("stale cache entry {fingerprint}: {reason}")]
    StaleCache { fingerprint: String, reason: String },

    /// Another builder holds the lease for this fingerprint.
    #[error("cache entry {fingerprint} is being built by another worker")]
    Busy { fingerprint: String },

    /// Filtering would leave nothing to train on.
    #[error("filtering would remove all {total} samples of {fingerprint}")]
    EmptyResult { fingerprint: String, total: usize },

    /// A collaborator (trainer, scorer, preprocessor) failed inside a stage.
    #[error("stage {stage} failed for {fingerprint}: {message}")]
    StageFailure {
        fingerprint: String,
        stage: Stage,
        message: String,
    },

    #[error("cache entry not found: {0}")]
    EntryNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a collaborator error, keeping the whole context chain in the message.
    pub fn stage_failure(fingerprint: impl Into<String>, stage: Stage, err: &anyhow::Error) -> Self {
        Self::StageFailure {
            fingerprint: fingerprint.into(),
            stage,
            message: format!("{err:#}"),
        }
    }

    /// Short machine-friendly class name, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::StaleCache { .. } => "stale_cache",
            Self::Busy { .. } => "busy",
            Self::EmptyResult { .. } => "empty_result",
            Self::StageFailure { .. } => "stage_failure",
            Self::EntryNotFound(_) => "entry_not_found",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<toml::de::Error> for CurationError {
    fn from(err: toml::de::Error) -> Self {
        CurationError::Config(err.to_string())
    }
}

/// Result type for sift domain operations.
pub type Result<T> = std::result::Result<T, CurationError>;
