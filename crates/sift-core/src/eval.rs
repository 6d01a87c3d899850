//! Deterministic evaluation of a checkpoint on one split.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::sample::{SampleRecord, Split};
use crate::scorer::{InferenceEngine, InferenceMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub split: Split,
    pub samples: usize,
    pub acc: f64,
    /// Mean per-class recall over the labels present in the split.
    pub balanced_acc: f64,
}

/// Evaluate `model` on `records`. An empty split reports zero accuracy.
pub fn evaluate_split(
    model: &dyn InferenceEngine,
    split: Split,
    records: &[SampleRecord],
) -> anyhow::Result<SplitMetrics> {
    let classes = model.classes();
    let mut correct = 0usize;
    // label -> (hits, total)
    let mut recall: BTreeMap<&str, (usize, usize)> = BTreeMap::new();

    for record in records {
        let probs = model.predict(record, InferenceMode::Deterministic)?;
        anyhow::ensure!(
            probs.len() == classes.len(),
            "sample {}: got {} probabilities for {} classes",
            record.id,
            probs.len(),
            classes.len()
        );
        let predicted = argmax(&probs).map(|i| classes[i].as_str());
        let hit = predicted == Some(record.label.as_str());

        let slot = recall.entry(record.label.as_str()).or_insert((0, 0));
        slot.1 += 1;
        if hit {
            correct += 1;
            slot.0 += 1;
        }
    }

    let (acc, balanced_acc) = if records.is_empty() {
        (0.0, 0.0)
    } else {
        let balanced = recall
            .values()
            .map(|(hits, total)| *hits as f64 / *total as f64)
            .sum::<f64>()
            / recall.len() as f64;
        (correct as f64 / records.len() as f64, balanced)
    };

    Ok(SplitMetrics {
        split,
        samples: records.len(),
        acc,
        balanced_acc,
    })
}

/// Index of the largest probability; the first one wins ties.
fn argmax(probs: &[f64]) -> Option<usize> {
    probs
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, b)) if b >= *p => best,
            _ => Some((i, *p)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Predicts "a" when the first feature is negative.
    struct SignModel {
        classes: Vec<String>,
    }

    impl InferenceEngine for SignModel {
        fn checkpoint_id(&self) -> &str {
            "sign"
        }

        fn classes(&self) -> &[String] {
            &self.classes
        }

        fn predict(&self, sample: &SampleRecord, mode: InferenceMode) -> anyhow::Result<Vec<f64>> {
            assert_eq!(mode, InferenceMode::Deterministic);
            Ok(if sample.features[0] < 0.0 {
                vec![0.9, 0.1]
            } else {
                vec![0.1, 0.9]
            })
        }
    }

    fn record(id: &str, label: &str, x: f32) -> SampleRecord {
        SampleRecord::new(id, label, Split::Test).with_features(vec![x])
    }

    #[test]
    fn test_accuracy_and_balanced_accuracy() {
        let model = SignModel {
            classes: vec!["a".into(), "b".into()],
        };
        // 8 "a" all correct, 2 "b" with one wrong.
        let mut records: Vec<_> = (0..8).map(|i| record(&format!("a{i}"), "a", -1.0)).collect();
        records.push(record("b0", "b", 1.0));
        records.push(record("b1", "b", -1.0));

        let metrics = evaluate_split(&model, Split::Test, &records).unwrap();
        assert_eq!(metrics.samples, 10);
        assert!((metrics.acc - 0.9).abs() < 1e-12);
        assert!((metrics.balanced_acc - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_split() {
        let model = SignModel {
            classes: vec!["a".into(), "b".into()],
        };
        let metrics = evaluate_split(&model, Split::Eval, &[]).unwrap();
        assert_eq!(metrics.samples, 0);
        assert_eq!(metrics.acc, 0.0);
    }

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[0.5, 0.5]), Some(0));
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
