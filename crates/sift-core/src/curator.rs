//! Score-based filtering of a training split.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::error::{CurationError, Result};
use crate::domain::sample::SampleRecord;
use crate::fingerprint::{self, format_rate, Fingerprint};
use crate::metrics::METRICS;
use crate::scorer::{ScoreTable, UncertaintyScore};

/// How `FilterPolicy::value` is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Remove the `value` highest-scored samples.
    TopKRemoved,
    /// Remove the highest-scored `value` fraction of samples.
    QuantileRemoved,
    /// Remove every sample scoring strictly above `value`.
    Threshold,
}

impl FilterMode {
    pub fn name(&self) -> &'static str {
        match self {
            FilterMode::TopKRemoved => "top_k_removed",
            FilterMode::QuantileRemoved => "quantile_removed",
            FilterMode::Threshold => "threshold",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FilterPolicy {
    pub mode: FilterMode,
    pub value: f64,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self::new(FilterMode::QuantileRemoved, 0.1)
    }
}

impl FilterPolicy {
    pub fn new(mode: FilterMode, value: f64) -> Self {
        Self { mode, value }
    }

    pub fn validate(&self) -> Result<()> {
        let v = self.value;
        let ok = v.is_finite()
            && match self.mode {
                FilterMode::TopKRemoved => v >= 0.0 && v.fract() == 0.0,
                FilterMode::QuantileRemoved => (0.0..=1.0).contains(&v),
                FilterMode::Threshold => v >= 0.0,
            };
        if ok {
            Ok(())
        } else {
            Err(CurationError::invalid(
                "curation.value",
                format!("{v} is not valid for {}", self.mode.name()),
            ))
        }
    }

    /// Short label used in curated dataset names.
    pub fn tag(&self) -> String {
        match self.mode {
            FilterMode::TopKRemoved => format!("{}_{}", self.mode.name(), self.value as u64),
            _ => format!("{}_{}", self.mode.name(), format_rate(self.value)),
        }
    }

    /// Number of samples to cut from a ranked list of `n`.
    fn removal_count(&self, ranked: &[&UncertaintyScore]) -> usize {
        let n = ranked.len();
        match self.mode {
            FilterMode::TopKRemoved => self.value as usize,
            FilterMode::QuantileRemoved => {
                if self.value == 0.0 {
                    0
                } else if self.value >= 1.0 || n < 2 {
                    n
                } else {
                    // Any fraction strictly inside (0, 1) removes something and
                    // keeps something.
                    ((self.value * n as f64).round() as usize).clamp(1, n - 1)
                }
            }
            FilterMode::Threshold => ranked.iter().take_while(|s| s.score > self.value).count(),
        }
    }
}

/// A training split minus its highest-uncertainty samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedDataset {
    pub fingerprint: Fingerprint,
    pub base: Fingerprint,
    pub policy: FilterPolicy,
    /// Lowest removed score, or the threshold in threshold mode.
    pub cutoff: Option<f64>,
    pub retained: BTreeSet<String>,
    /// Removed samples, highest score first.
    pub removed: Vec<UncertaintyScore>,
}

impl CuratedDataset {
    pub fn name(&self) -> &str {
        self.fingerprint.name()
    }

    pub fn len(&self) -> usize {
        self.retained.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.retained.contains(sample_id)
    }

    /// Keep only retained records, preserving input order.
    pub fn apply(&self, records: Vec<SampleRecord>) -> Vec<SampleRecord> {
        records.into_iter().filter(|r| self.contains(&r.id)).collect()
    }
}

/// Stateless filter over score tables.
pub struct Curator;

impl Curator {
    /// Rank by `(score desc, sample_id asc)` and cut per `policy`.
    ///
    /// Fails with `EmptyResult` when nothing would be left.
    pub fn filter(scores: &ScoreTable, policy: &FilterPolicy) -> Result<CuratedDataset> {
        policy.validate()?;
        let base = scores.dataset().clone();
        let fingerprint =
            fingerprint::derive_curated(&base, policy, &scores.provenance_digest()?)?;

        let mut ranked: Vec<&UncertaintyScore> = scores.scores().values().collect();
        ranked.sort_by(|a, b| rank_order(a, b));

        let total = ranked.len();
        let cut = policy.removal_count(&ranked);
        if cut >= total {
            return Err(CurationError::EmptyResult {
                fingerprint: base.name().to_string(),
                total,
            });
        }

        let cutoff = match policy.mode {
            FilterMode::Threshold => Some(policy.value),
            _ if cut > 0 => Some(ranked[cut - 1].score),
            _ => None,
        };
        let removed: Vec<UncertaintyScore> = ranked[..cut].iter().map(|s| (*s).clone()).collect();
        let retained: BTreeSet<String> =
            ranked[cut..].iter().map(|s| s.sample_id.clone()).collect();

        METRICS.add_samples_removed(removed.len() as u64);
        info!(
            event = "curate.filtered",
            base = %base,
            curated = %fingerprint,
            policy = %policy.tag(),
            removed = removed.len(),
            retained = retained.len(),
        );

        Ok(CuratedDataset {
            fingerprint,
            base,
            policy: *policy,
            cutoff,
            retained,
            removed,
        })
    }
}

fn rank_order(a: &UncertaintyScore, b: &UncertaintyScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.sample_id.cmp(&b.sample_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::Split;
    use crate::RunParameters;

    /// `n` samples `s-0..s-{n-1}` where `s-i` scores `level(i)`.
    fn table(n: usize, level: impl Fn(usize) -> f64) -> ScoreTable {
        let fp = fingerprint::derive(&RunParameters::for_dataset("tuab")).unwrap();
        let ids: Vec<String> = (0..n).map(|i| format!("s-{i}")).collect();
        ScoreTable::from_scores(&fp, ids.iter().enumerate().map(|(i, id)| (id.as_str(), level(i))))
    }

    fn ramp(n: usize) -> ScoreTable {
        table(n, |i| i as f64 / 100.0)
    }

    #[test]
    fn test_quantile_removes_highest_twenty_percent() {
        let scores = ramp(100);
        let curated =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::QuantileRemoved, 0.2)).unwrap();

        assert_eq!(curated.len(), 80);
        assert_eq!(curated.removed.len(), 20);
        for i in 80..100 {
            assert!(!curated.contains(&format!("s-{i}")));
        }
        for i in 0..80 {
            assert!(curated.contains(&format!("s-{i}")));
        }
        assert_eq!(curated.removed[0].sample_id, "s-99");
        assert_eq!(curated.cutoff, Some(0.8));
    }

    #[test]
    fn test_subset_law_across_fractions() {
        for n in [7usize, 10, 33, 100] {
            let scores = table(n, |i| ((i * 37) % 11) as f64);
            for f in [0.05, 0.1, 0.25, 0.5, 0.75, 0.9] {
                let curated =
                    Curator::filter(&scores, &FilterPolicy::new(FilterMode::QuantileRemoved, f))
                        .unwrap();
                let expected = ((1.0 - f) * n as f64).round() as i64;
                assert!(
                    (curated.len() as i64 - expected).abs() <= 1,
                    "n={n} f={f} kept={}",
                    curated.len()
                );
                assert!(!curated.is_empty() && curated.len() < n);
                assert!(curated.retained.iter().all(|id| scores.get(id).is_some()));
            }
        }
    }

    #[test]
    fn test_ties_broken_by_sample_id() {
        // s-20..s-29 share the top score.
        let scores = table(30, |i| (i / 10) as f64);
        let curated =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::TopKRemoved, 5.0)).unwrap();
        let removed: Vec<_> = curated.removed.iter().map(|s| s.sample_id.as_str()).collect();
        assert_eq!(removed, vec!["s-20", "s-21", "s-22", "s-23", "s-24"]);

        let again =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::TopKRemoved, 5.0)).unwrap();
        assert_eq!(curated, again);
    }

    #[test]
    fn test_threshold_keeps_boundary_ties() {
        let scores = table(30, |i| (i / 10) as f64);
        let curated =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::Threshold, 1.0)).unwrap();
        assert!(curated.contains("s-10"));
        assert!(curated.contains("s-19"));
        assert!(!curated.contains("s-20"));
        assert_eq!(curated.len(), 20);
        assert_eq!(curated.cutoff, Some(1.0));
    }

    #[test]
    fn test_removing_everything_fails() {
        let scores = ramp(10);
        for policy in [
            FilterPolicy::new(FilterMode::TopKRemoved, 10.0),
            FilterPolicy::new(FilterMode::QuantileRemoved, 1.0),
            FilterPolicy::new(FilterMode::Threshold, 0.0),
        ] {
            let result = Curator::filter(&scores, &policy);
            if policy.mode == FilterMode::Threshold {
                // s-0 scores exactly 0.0 and is kept.
                assert_eq!(result.unwrap().len(), 1);
            } else {
                assert!(
                    matches!(result, Err(CurationError::EmptyResult { total: 10, .. })),
                    "{policy:?}"
                );
            }
        }

        let single = ramp(1);
        assert!(matches!(
            Curator::filter(&single, &FilterPolicy::new(FilterMode::QuantileRemoved, 0.5)),
            Err(CurationError::EmptyResult { total: 1, .. })
        ));
    }

    #[test]
    fn test_zero_removal_keeps_everything() {
        let scores = ramp(10);
        let curated =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::QuantileRemoved, 0.0)).unwrap();
        assert_eq!(curated.len(), 10);
        assert!(curated.removed.is_empty());
        assert_eq!(curated.cutoff, None);
    }

    #[test]
    fn test_invalid_policy_values() {
        let scores = ramp(4);
        for policy in [
            FilterPolicy::new(FilterMode::TopKRemoved, 1.5),
            FilterPolicy::new(FilterMode::QuantileRemoved, -0.1),
            FilterPolicy::new(FilterMode::Threshold, f64::NAN),
        ] {
            assert!(matches!(
                Curator::filter(&scores, &policy),
                Err(CurationError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn test_curated_fingerprint_depends_on_policy() {
        let scores = ramp(20);
        let a = Curator::filter(&scores, &FilterPolicy::new(FilterMode::QuantileRemoved, 0.2))
            .unwrap();
        let b = Curator::filter(&scores, &FilterPolicy::new(FilterMode::TopKRemoved, 4.0)).unwrap();
        assert_eq!(a.retained, b.retained);
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, *scores.dataset());
    }

    #[test]
    fn test_policy_tags() {
        assert_eq!(FilterPolicy::new(FilterMode::TopKRemoved, 20.0).tag(), "top_k_removed_20");
        assert_eq!(
            FilterPolicy::new(FilterMode::QuantileRemoved, 0.2).tag(),
            "quantile_removed_0.2"
        );
        assert_eq!(FilterPolicy::new(FilterMode::Threshold, 1.0).tag(), "threshold_1.0");
    }

    #[test]
    fn test_apply_preserves_order() {
        let scores = ramp(10);
        let curated =
            Curator::filter(&scores, &FilterPolicy::new(FilterMode::TopKRemoved, 3.0)).unwrap();
        let records: Vec<_> = (0..10)
            .rev()
            .map(|i| SampleRecord::new(format!("s-{i}"), "a", Split::Train))
            .collect();
        let kept: Vec<_> = curated.apply(records).into_iter().map(|r| r.id).collect();
        assert_eq!(kept, vec!["s-6", "s-5", "s-4", "s-3", "s-2", "s-1", "s-0"]);
    }
}
