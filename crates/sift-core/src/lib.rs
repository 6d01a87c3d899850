//! Sift Core Library
//!
//! Fingerprinted dataset cache, stochastic uncertainty scoring and
//! score-based curation. The pipeline state machine and sweep runner live in
//! `sift-pipeline`.

pub mod cache;
pub mod centroid;
pub mod config;
pub mod curator;
pub mod domain;
pub mod eval;
pub mod fingerprint;
pub mod metrics;
pub mod obs;
pub mod preprocess;
pub mod reporting;
pub mod scorer;
pub mod telemetry;

pub use domain::{
    CacheConfig, CurationError, LoggingConfig, PreprocConfig, Result, RunParameters, SampleRecord,
    ScoringConfig, Split, Stage, TrainingConfig,
};

pub use cache::{CacheEntry, CacheManifest, CacheStore, EntryStatus, LockPolicy, Partition};
pub use centroid::CentroidModel;
pub use curator::{CuratedDataset, Curator, FilterMode, FilterPolicy};
pub use eval::{evaluate_split, SplitMetrics};
pub use fingerprint::{derive, derive_curated, Fingerprint};
pub use preprocess::{DropoutPreprocessor, Preprocessor};
pub use reporting::{Phase, ResultRow, SummaryRow};
pub use scorer::{
    Dispersion, InferenceEngine, InferenceMode, ScoreTable, StochasticScorer, UncertaintyScore,
};

pub use metrics::METRICS;
pub use obs::MemberSpan;
pub use telemetry::init_tracing;

/// Sift version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
