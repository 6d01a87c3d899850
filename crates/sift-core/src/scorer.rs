//! Stochastic uncertainty scoring.
//!
//! Every sample is pushed through the model `passes` times with randomization
//! active. The spread of the per-pass class distributions is the sample's
//! uncertainty score. Samples are scored in parallel; each (sample, pass) pair
//! gets its own seed derived from the scorer seed, so results do not depend on
//! thread scheduling.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::digest::compute_digest;
use crate::domain::error::{CurationError, Result};
use crate::domain::params::ScoringConfig;
use crate::domain::sample::SampleRecord;
use crate::domain::stage::Stage;
use crate::fingerprint::Fingerprint;
use crate::metrics::METRICS;

/// How the inference entry point treats its randomized layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceMode {
    /// Standard evaluation: randomization disabled, output is a pure function
    /// of the sample.
    Deterministic,
    /// Randomization active, driven by `seed`.
    Stochastic { seed: u64 },
}

/// A loaded model checkpoint that can classify samples.
pub trait InferenceEngine: Send + Sync {
    /// Stable identifier of the checkpoint.
    fn checkpoint_id(&self) -> &str;

    /// Class labels, in the order `predict` reports probabilities.
    fn classes(&self) -> &[String];

    /// Class probability distribution for `sample`.
    fn predict(&self, sample: &SampleRecord, mode: InferenceMode) -> anyhow::Result<Vec<f64>>;
}

/// Aggregation of per-pass outputs into a single score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dispersion {
    /// Mean over classes of the sample variance across passes.
    #[default]
    Variance,
    /// Entropy of the mean distribution.
    PredictiveEntropy,
    /// Predictive entropy minus mean per-pass entropy (BALD).
    MutualInformation,
}

impl Dispersion {
    fn aggregate(&self, outputs: &[Vec<f64>]) -> f64 {
        let passes = outputs.len() as f64;
        let classes = outputs[0].len();
        let mean: Vec<f64> = (0..classes)
            .map(|c| outputs.iter().map(|p| p[c]).sum::<f64>() / passes)
            .collect();

        let value = match self {
            Dispersion::Variance => {
                if classes == 0 {
                    0.0
                } else {
                    (0..classes)
                        .map(|c| {
                            outputs.iter().map(|p| (p[c] - mean[c]).powi(2)).sum::<f64>()
                                / (passes - 1.0)
                        })
                        .sum::<f64>()
                        / classes as f64
                }
            }
            Dispersion::PredictiveEntropy => entropy(&mean),
            Dispersion::MutualInformation => {
                let expected = outputs.iter().map(|p| entropy(p)).sum::<f64>() / passes;
                entropy(&mean) - expected
            }
        };
        // Rounding can push an exact zero slightly negative.
        value.max(0.0)
    }
}

fn entropy(p: &[f64]) -> f64 {
    -p.iter().filter(|x| **x > 0.0).map(|x| x * x.ln()).sum::<f64>()
}

/// Uncertainty of one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyScore {
    pub sample_id: String,
    pub score: f64,
    pub pass_count: usize,
}

/// Scores for one (checkpoint, dataset) pair. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    checkpoint: String,
    dataset: Fingerprint,
    passes: usize,
    seed: u64,
    dispersion: Dispersion,
    computed_at: DateTime<Utc>,
    scores: BTreeMap<String, UncertaintyScore>,
}

impl ScoreTable {
    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    pub fn dataset(&self) -> &Fingerprint {
        &self.dataset
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn scores(&self) -> &BTreeMap<String, UncertaintyScore> {
        &self.scores
    }

    pub fn get(&self, sample_id: &str) -> Option<&UncertaintyScore> {
        self.scores.get(sample_id)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Digest of everything that determined these scores.
    pub fn provenance_digest(&self) -> Result<String> {
        provenance(&self.checkpoint, &self.dataset, self.passes, self.seed, self.dispersion)
    }

    /// Whether this table was produced by `scorer` for `checkpoint` on `dataset`.
    pub fn matches(&self, scorer: &StochasticScorer, checkpoint: &str, dataset: &Fingerprint) -> bool {
        self.checkpoint == checkpoint
            && &self.dataset == dataset
            && self.passes == scorer.passes
            && self.seed == scorer.seed
            && self.dispersion == scorer.dispersion
    }

    /// Write the table to `path`. Refuses to replace an existing file.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.persist_noclobber(path).map_err(|e| CurationError::Io(e.error))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    #[cfg(test)]
    pub(crate) fn from_scores<'a>(
        dataset: &Fingerprint,
        scores: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Self {
        Self {
            checkpoint: "fixed".to_string(),
            dataset: dataset.clone(),
            passes: 2,
            seed: 0,
            dispersion: Dispersion::default(),
            computed_at: Utc::now(),
            scores: scores
                .into_iter()
                .map(|(id, score)| {
                    let entry = UncertaintyScore {
                        sample_id: id.to_string(),
                        score,
                        pass_count: 2,
                    };
                    (id.to_string(), entry)
                })
                .collect(),
        }
    }
}

/// Runs repeated stochastic inference to estimate per-sample uncertainty.
#[derive(Debug, Clone, PartialEq)]
pub struct StochasticScorer {
    passes: usize,
    seed: u64,
    dispersion: Dispersion,
}

impl StochasticScorer {
    /// A scorer running `passes` passes per sample. One pass cannot estimate
    /// dispersion, so `passes` must be at least 2.
    pub fn new(passes: usize, seed: u64) -> Result<Self> {
        if passes < 2 {
            return Err(CurationError::invalid(
                "passes",
                format!("need at least 2 passes to estimate dispersion, got {passes}"),
            ));
        }
        Ok(Self {
            passes,
            seed,
            dispersion: Dispersion::default(),
        })
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        Ok(Self::new(config.passes, config.seed)?.with_dispersion(config.dispersion))
    }

    pub fn with_dispersion(mut self, dispersion: Dispersion) -> Self {
        self.dispersion = dispersion;
        self
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Provenance digest of the table this scorer would produce.
    pub fn provenance_digest(&self, checkpoint: &str, dataset: &Fingerprint) -> Result<String> {
        provenance(checkpoint, dataset, self.passes, self.seed, self.dispersion)
    }

    /// Score every sample of `samples`, which belong to `dataset`.
    ///
    /// All-or-nothing: any inference failure fails the whole call.
    pub fn score(
        &self,
        model: &dyn InferenceEngine,
        dataset: &Fingerprint,
        samples: &[SampleRecord],
    ) -> Result<ScoreTable> {
        let mut seen = std::collections::HashSet::with_capacity(samples.len());
        if let Some(dup) = samples.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(CurationError::invalid(
                "dataset",
                format!("duplicate sample id '{}' in {}", dup.id, dataset),
            ));
        }

        debug!(
            dataset = %dataset,
            checkpoint = model.checkpoint_id(),
            samples = samples.len(),
            passes = self.passes,
            "scoring"
        );

        let scored: Vec<UncertaintyScore> = samples
            .par_iter()
            .map(|sample| self.score_sample(model, sample))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| CurationError::stage_failure(dataset.name(), Stage::Score, &e))?;

        METRICS.add_scoring_passes((samples.len() * self.passes) as u64);
        info!(
            event = "score.completed",
            dataset = %dataset,
            checkpoint = model.checkpoint_id(),
            samples = scored.len(),
        );

        Ok(ScoreTable {
            checkpoint: model.checkpoint_id().to_string(),
            dataset: dataset.clone(),
            passes: self.passes,
            seed: self.seed,
            dispersion: self.dispersion,
            computed_at: Utc::now(),
            scores: scored.into_iter().map(|s| (s.sample_id.clone(), s)).collect(),
        })
    }

    fn score_sample(
        &self,
        model: &dyn InferenceEngine,
        sample: &SampleRecord,
    ) -> anyhow::Result<UncertaintyScore> {
        let mut outputs: Vec<Vec<f64>> = Vec::with_capacity(self.passes);
        for pass in 0..self.passes {
            let mode = InferenceMode::Stochastic {
                seed: pass_seed(self.seed, &sample.id, pass),
            };
            let probs = model.predict(sample, mode)?;
            if let Some(first) = outputs.first() {
                anyhow::ensure!(
                    first.len() == probs.len(),
                    "sample {}: pass {} returned {} classes, expected {}",
                    sample.id,
                    pass,
                    probs.len(),
                    first.len()
                );
            }
            anyhow::ensure!(
                probs.iter().all(|p| p.is_finite()),
                "sample {}: pass {} returned a non-finite probability",
                sample.id,
                pass
            );
            outputs.push(probs);
        }

        Ok(UncertaintyScore {
            sample_id: sample.id.clone(),
            score: self.dispersion.aggregate(&outputs),
            pass_count: outputs.len(),
        })
    }
}

fn provenance(
    checkpoint: &str,
    dataset: &Fingerprint,
    passes: usize,
    seed: u64,
    dispersion: Dispersion,
) -> Result<String> {
    compute_digest(&json!({
        "checkpoint": checkpoint,
        "dataset": dataset.digest(),
        "passes": passes,
        "seed": seed,
        "dispersion": dispersion,
    }))
}

/// Seed for one (sample, pass): the first 8 bytes of
/// `sha256(seed || sample_id || pass)`.
fn pass_seed(seed: u64, sample_id: &str, pass: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(sample_id.as_bytes());
    hasher.update(b"\0");
    hasher.update((pass as u64).to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
