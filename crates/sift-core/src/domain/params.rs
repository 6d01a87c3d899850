//! Run parameters.
//!
//! `RunParameters` is built once (config file + overrides) and then passed by
//! reference down the whole call chain. Nothing in the pipeline reads
//! configuration from anywhere else.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::LockPolicy;
use crate::curator::FilterPolicy;
use crate::domain::error::{CurationError, Result};
use crate::scorer::Dispersion;

/// Immutable description of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Human-readable run name. Does not participate in any fingerprint.
    #[serde(default = "default_name")]
    pub name: String,

    pub preproc: PreprocConfig,

    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub curation: FilterPolicy,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_name() -> String {
    "run".to_string()
}

/// Preprocessing section. Every field except `source` participates in the
/// dataset fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocConfig {
    /// Dataset identity, used as the stem of cache directory names.
    pub dataset: String,

    /// Builder variant of the dataset (e.g. "finetune", "pretrain").
    #[serde(default = "default_variant")]
    pub variant: String,

    /// Location of the raw JSONL samples. Moving the raw files does not change
    /// what preprocessing produces, so this is excluded from identity.
    #[serde(default)]
    pub source: PathBuf,

    #[serde(default)]
    pub random_dropout: bool,

    #[serde(default)]
    pub dropout_rate: f64,

    #[serde(default)]
    pub dropout_seed: i64,
}

fn default_variant() -> String {
    "default".to_string()
}

impl PreprocConfig {
    /// Dropout only changes the data when it is both enabled and non-zero.
    pub fn dropout_active(&self) -> bool {
        self.random_dropout && self.dropout_rate > 0.0
    }
}

/// Model/training section. Opaque to fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,

    #[serde(default)]
    pub seed: u64,

    /// Probability of masking a feature during stochastic inference.
    #[serde(default = "default_inference_dropout")]
    pub inference_dropout: f64,

    /// Free-form model options forwarded to the trainer.
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_model_type() -> String {
    "centroid".to_string()
}

fn default_inference_dropout() -> f64 {
    0.2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            seed: 0,
            inference_dropout: default_inference_dropout(),
            options: serde_json::Value::Null,
        }
    }
}

/// Stochastic scoring section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_passes")]
    pub passes: usize,

    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub dispersion: Dispersion,
}

fn default_passes() -> usize {
    10
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            passes: default_passes(),
            seed: 0,
            dispersion: Dispersion::default(),
        }
    }
}

/// Cache section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub lock: LockPolicy,

    /// Invalidate the base entry before preprocessing, forcing a rebuild.
    #[serde(default)]
    pub clean_before_build: bool,

    /// Invalidate and rebuild on a stale entry instead of failing the member.
    #[serde(default)]
    pub rebuild_stale: bool,

    /// Leases not refreshed for this long are considered abandoned.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,

    /// How long to wait on another process's live build before giving up.
    #[serde(default = "default_lease_wait_secs")]
    pub lease_wait_secs: u64,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(".sift/cache")
}

fn default_lease_timeout_secs() -> u64 {
    600
}

fn default_lease_wait_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            lock: LockPolicy::default(),
            clean_before_build: false,
            rebuild_stale: false,
            lease_timeout_secs: default_lease_timeout_secs(),
            lease_wait_secs: default_lease_wait_secs(),
        }
    }
}

/// Logging and output section. Opaque to fingerprinting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_verbosity")]
    pub verbosity: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Append transition records to `<output_dir>/tracking.jsonl`.
    #[serde(default = "default_tracking")]
    pub tracking: bool,
}

fn default_verbosity() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_tracking() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbosity: default_verbosity(),
            json: false,
            output_dir: default_output_dir(),
            tracking: default_tracking(),
        }
    }
}

impl RunParameters {
    /// Minimal parameters for `dataset`, everything else defaulted.
    pub fn for_dataset(dataset: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            preproc: PreprocConfig {
                dataset: dataset.into(),
                variant: default_variant(),
                source: PathBuf::new(),
                random_dropout: false,
                dropout_rate: 0.0,
                dropout_seed: 0,
            },
            training: TrainingConfig::default(),
            scoring: ScoringConfig::default(),
            curation: FilterPolicy::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_dropout(mut self, enabled: bool, rate: f64, seed: i64) -> Self {
        self.preproc.random_dropout = enabled;
        self.preproc.dropout_rate = rate;
        self.preproc.dropout_seed = seed;
        self
    }

    /// Check every section. Runs before any stage touches the filesystem.
    pub fn validate(&self) -> Result<()> {
        validate_preproc(&self.preproc)?;
        if self.scoring.passes < 2 {
            return Err(CurationError::invalid(
                "scoring.passes",
                format!("need at least 2 passes to estimate dispersion, got {}", self.scoring.passes),
            ));
        }
        if !(0.0..1.0).contains(&self.training.inference_dropout) {
            return Err(CurationError::invalid(
                "training.inference_dropout",
                "must be within [0, 1)",
            ));
        }
        if self.training.model_type.trim().is_empty() {
            return Err(CurationError::invalid("training.model_type", "must not be empty"));
        }
        self.curation.validate()
    }
}

/// Checks shared by validation and fingerprint derivation.
pub(crate) fn validate_preproc(preproc: &PreprocConfig) -> Result<()> {
    check_name_component("preproc.dataset", &preproc.dataset)?;
    check_name_component("preproc.variant", &preproc.variant)?;
    if !preproc.dropout_rate.is_finite() || !(0.0..=1.0).contains(&preproc.dropout_rate) {
        return Err(CurationError::invalid(
            "preproc.dropout_rate",
            format!("must be within [0, 1], got {}", preproc.dropout_rate),
        ));
    }
    if preproc.dropout_seed < 0 {
        return Err(CurationError::invalid(
            "preproc.dropout_seed",
            format!("must be non-negative, got {}", preproc.dropout_seed),
        ));
    }
    Ok(())
}

/// `dataset` and `variant` are spelled verbatim into cache directory names,
/// so they are limited to `[A-Za-z0-9.-]` and may not start with a dot.
/// `_` is reserved as the separator between name parts.
fn check_name_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CurationError::invalid(field, "must not be empty"));
    }
    if value.starts_with('.') {
        return Err(CurationError::invalid(
            field,
            format!("'{value}' must not start with '.'"),
        ));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
    {
        return Err(CurationError::invalid(
            field,
            format!("'{value}' contains '{bad}'; use letters, digits, '-' or '.'"),
        ));
    }
    Ok(())
}
