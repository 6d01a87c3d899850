//! Nearest-centroid reference model.
//!
//! Class probabilities are a softmax over negative mean squared distances to
//! each class centroid. Stochastic inference applies an inverted-dropout mask
//! to the input features, so repeated passes disagree more on samples that
//! sit between centroids.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::digest::compute_digest;
use crate::domain::sample::SampleRecord;
use crate::scorer::{InferenceEngine, InferenceMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidModel {
    id: String,
    classes: Vec<String>,
    centroids: Vec<Vec<f64>>,
    inference_dropout: f64,
}

impl CentroidModel {
    /// Fit one centroid per label. Labels are ordered lexicographically.
    pub fn fit(records: &[SampleRecord], inference_dropout: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(!records.is_empty(), "cannot fit on an empty training set");
        anyhow::ensure!(
            (0.0..1.0).contains(&inference_dropout),
            "inference_dropout must be within [0, 1), got {inference_dropout}"
        );
        let dim = records[0].features.len();
        anyhow::ensure!(dim > 0, "sample {} has no features", records[0].id);

        let mut sums: BTreeMap<&str, (Vec<f64>, usize)> = BTreeMap::new();
        for record in records {
            anyhow::ensure!(
                record.features.len() == dim,
                "sample {} has {} features, expected {dim}",
                record.id,
                record.features.len()
            );
            let (sum, n) = sums
                .entry(record.label.as_str())
                .or_insert_with(|| (vec![0.0; dim], 0));
            for (acc, x) in sum.iter_mut().zip(&record.features) {
                *acc += f64::from(*x);
            }
            *n += 1;
        }

        let classes: Vec<String> = sums.keys().map(|k| k.to_string()).collect();
        let centroids: Vec<Vec<f64>> = sums
            .into_values()
            .map(|(sum, n)| sum.into_iter().map(|s| s / n as f64).collect())
            .collect();

        // Content-derived id: refitting on identical data gives the same
        // checkpoint, which keeps score reuse and curated names stable.
        let digest = compute_digest(&json!({
            "classes": classes,
            "centroids": centroids,
            "inference_dropout": inference_dropout,
        }))?;
        Ok(Self {
            id: format!("centroid-{}", &digest[..16]),
            classes,
            centroids,
            inference_dropout,
        })
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("write checkpoint {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("read checkpoint {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse checkpoint {}", path.display()))
    }

    pub fn dim(&self) -> usize {
        self.centroids.first().map_or(0, Vec::len)
    }
}

impl InferenceEngine for CentroidModel {
    fn checkpoint_id(&self) -> &str {
        &self.id
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, sample: &SampleRecord, mode: InferenceMode) -> anyhow::Result<Vec<f64>> {
        let dim = self.dim();
        anyhow::ensure!(
            sample.features.len() == dim,
            "sample {} has {} features, model expects {dim}",
            sample.id,
            sample.features.len()
        );

        let input: Vec<f64> = match mode {
            InferenceMode::Deterministic => sample.features.iter().map(|x| f64::from(*x)).collect(),
            InferenceMode::Stochastic { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let keep = 1.0 - self.inference_dropout;
                sample
                    .features
                    .iter()
                    .map(|x| {
                        if rng.gen::<f64>() < self.inference_dropout {
                            0.0
                        } else {
                            f64::from(*x) / keep
                        }
                    })
                    .collect()
            }
        };

        let logits: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| {
                -c.iter().zip(&input).map(|(m, x)| (m - x).powi(2)).sum::<f64>() / dim as f64
            })
            .collect();
        Ok(softmax(&logits))
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exp.iter().sum();
    exp.into_iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Split;

    fn sample(id: &str, label: &str, features: &[f32]) -> SampleRecord {
        SampleRecord::new(id, label, Split::Train).with_features(features.to_vec())
    }

    fn blobs() -> Vec<SampleRecord> {
        vec![
            sample("a1", "a", &[0.0, 0.0]),
            sample("a2", "a", &[0.2, 0.0]),
            sample("b1", "b", &[4.0, 4.0]),
            sample("b2", "b", &[4.0, 3.8]),
        ]
    }

    #[test]
    fn test_fit_and_predict_deterministic() {
        let model = CentroidModel::fit(&blobs(), 0.2).unwrap();
        assert_eq!(model.classes(), &["a".to_string(), "b".to_string()]);

        let probs = model
            .predict(&sample("q", "?", &[0.1, 0.1]), InferenceMode::Deterministic)
            .unwrap();
        assert!(probs[0] > 0.9);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);

        let again = model
            .predict(&sample("q", "?", &[0.1, 0.1]), InferenceMode::Deterministic)
            .unwrap();
        assert_eq!(probs, again);
    }

    #[test]
    fn test_stochastic_passes_vary_and_are_seeded() {
        let model = CentroidModel::fit(&blobs(), 0.5).unwrap();
        let q = sample("q", "?", &[2.0, 2.0]);
        let outputs: Vec<_> = (0..16)
            .map(|seed| model.predict(&q, InferenceMode::Stochastic { seed }).unwrap())
            .collect();
        assert!(outputs.iter().any(|o| o != &outputs[0]));
        assert_eq!(
            model.predict(&q, InferenceMode::Stochastic { seed: 3 }).unwrap(),
            outputs[3]
        );
    }

    #[test]
    fn test_id_is_content_derived() {
        let a = CentroidModel::fit(&blobs(), 0.2).unwrap();
        let b = CentroidModel::fit(&blobs(), 0.2).unwrap();
        assert_eq!(a.checkpoint_id(), b.checkpoint_id());

        let fewer = CentroidModel::fit(&blobs()[1..], 0.2).unwrap();
        assert_ne!(a.checkpoint_id(), fewer.checkpoint_id());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt/model.json");
        let model = CentroidModel::fit(&blobs(), 0.2).unwrap();
        model.save(&path).unwrap();
        assert_eq!(CentroidModel::load(&path).unwrap(), model);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut records = blobs();
        records.push(sample("c1", "c", &[1.0]));
        assert!(CentroidModel::fit(&records, 0.2).is_err());

        let model = CentroidModel::fit(&blobs(), 0.2).unwrap();
        assert!(model
            .predict(&sample("q", "?", &[1.0, 2.0, 3.0]), InferenceMode::Deterministic)
            .is_err());
    }
}
