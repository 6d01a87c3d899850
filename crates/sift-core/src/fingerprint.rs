//! Dataset identity.
//!
//! A [`Fingerprint`] names a cache directory and carries the SHA-256 digest of
//! the canonical encoding of the parameters that shape preprocessing output.
//! Derivation is a pure function of [`RunParameters`]; nothing is written back
//! into the parameters.
//!
//! Directory names follow the scheme used by the sweep tooling:
//! `<base>` for the dropout-free baseline and
//! `<base>_dropout_<rate>_seed_<seed>` when dropout changes the data.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::curator::FilterPolicy;
use crate::domain::digest::compute_digest;
use crate::domain::error::Result;
use crate::domain::params::{validate_preproc, PreprocConfig, RunParameters};

/// Version of the materialized partition layout. Participates in every
/// fingerprint so a layout change can never reuse old entries.
pub const LAYOUT_VERSION: u32 = 1;

/// Deterministic identity of a materialized dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    name: String,
    digest: String,
}

impl Fingerprint {
    /// Cache directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full SHA-256 hex digest of the identity encoding.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First 12 hex chars of the digest.
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Derive the preprocessing fingerprint of a run.
///
/// Only the `preproc` section is consulted, and within it only the
/// whitelisted fields returned by [`identity_fields`].
pub fn derive(params: &RunParameters) -> Result<Fingerprint> {
    derive_preproc(&params.preproc)
}

/// Derive a fingerprint straight from the preprocessing section.
pub fn derive_preproc(preproc: &PreprocConfig) -> Result<Fingerprint> {
    validate_preproc(preproc)?;

    let base = base_name(preproc);
    let name = if preproc.dropout_active() {
        format!(
            "{base}_dropout_{}_seed_{}",
            format_rate(preproc.dropout_rate),
            preproc.dropout_seed
        )
    } else {
        base
    };

    Ok(Fingerprint {
        name,
        digest: compute_digest(&identity_fields(preproc))?,
    })
}

/// Normalized identity encoding.
///
/// Inactive dropout (disabled, or rate 0) encodes as `null`, so it is
/// indistinguishable from a config that never mentioned dropout.
pub fn identity_fields(preproc: &PreprocConfig) -> Value {
    let dropout = if preproc.dropout_active() {
        json!({ "rate": preproc.dropout_rate, "seed": preproc.dropout_seed })
    } else {
        Value::Null
    };
    json!({
        "layout": LAYOUT_VERSION,
        "dataset": preproc.dataset,
        "variant": preproc.variant,
        "dropout": dropout,
    })
}

/// Fingerprint of a curated subset of `base`.
///
/// `score_provenance` identifies how the scores were produced (see
/// `ScoreTable::provenance_digest`). Curated entries live in their own
/// directories and never collide with the base or with other policies.
pub fn derive_curated(
    base: &Fingerprint,
    policy: &FilterPolicy,
    score_provenance: &str,
) -> Result<Fingerprint> {
    policy.validate()?;
    let digest = compute_digest(&json!({
        "base": base.digest,
        "policy": policy,
        "scores": score_provenance,
    }))?;
    let name = format!("{}__curated_{}_{}", base.name, policy.tag(), &digest[..8]);
    Ok(Fingerprint { name, digest })
}

fn base_name(preproc: &PreprocConfig) -> String {
    if preproc.variant == "default" {
        preproc.dataset.clone()
    } else {
        format!("{}_{}", preproc.dataset, preproc.variant)
    }
}

/// Rates always carry a decimal point so `1` and `1.0` name the same dir.
pub(crate) fn format_rate(rate: f64) -> String {
    let s = format!("{rate}");
    if s.contains('.') {
        s
    } else {
        format!("{s}.0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curator::FilterMode;
    use crate::domain::error::CurationError;

    fn params(enabled: bool, rate: f64, seed: i64) -> RunParameters {
        RunParameters::for_dataset("tuab").with_dropout(enabled, rate, seed)
    }

    #[test]
    fn test_non_participating_fields_do_not_perturb() {
        let a = params(true, 0.5, 12);
        let mut b = a.clone();
        b.name = "another-run".to_string();
        b.logging.verbosity = "trace".to_string();
        b.training.seed = 99;
        b.scoring.passes = 50;
        b.preproc.source = "/elsewhere/raw.jsonl".into();

        assert_eq!(derive(&a).unwrap(), derive(&b).unwrap());
    }

    #[test]
    fn test_baseline_equivalence() {
        for seed in [0, 1, 12, 4096] {
            let disabled = derive(&params(false, 0.0, seed)).unwrap();
            let enabled_zero = derive(&params(true, 0.0, seed)).unwrap();
            let disabled_nonzero = derive(&params(false, 0.7, seed)).unwrap();
            assert_eq!(disabled, enabled_zero);
            assert_eq!(disabled, disabled_nonzero);
            assert_eq!(disabled.name(), "tuab");
        }
    }

    #[test]
    fn test_distinct_rates_distinct_fingerprints() {
        let a = derive(&params(true, 0.3, 7)).unwrap();
        let b = derive(&params(true, 0.5, 7)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.name(), b.name());
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_dropout_directory_suffix() {
        let fp = derive(&params(true, 0.5, 12)).unwrap();
        assert_eq!(fp.name(), "tuab_dropout_0.5_seed_12");
        assert!(fp.name().ends_with("dropout_0.5_seed_12"));
    }

    #[test]
    fn test_full_rate_keeps_decimal_point() {
        let fp = derive(&params(true, 1.0, 3)).unwrap();
        assert_eq!(fp.name(), "tuab_dropout_1.0_seed_3");
    }

    #[test]
    fn test_variant_joins_base_name() {
        let mut p = params(false, 0.0, 0);
        p.preproc.variant = "finetune".to_string();
        assert_eq!(derive(&p).unwrap().name(), "tuab_finetune");
    }

    #[test]
    fn test_names_that_would_collide_are_rejected() {
        let named = |dataset: &str| RunParameters::for_dataset(dataset);

        // "eeg set" would otherwise share a directory with "eeg-set".
        assert!(matches!(
            derive(&named("eeg set")),
            Err(CurationError::InvalidParameter { ref field, .. }) if field == "preproc.dataset"
        ));
        assert_eq!(derive(&named("eeg-set")).unwrap().name(), "eeg-set");

        // "a_b" would otherwise share a directory with dataset "a", variant "b".
        assert!(derive(&named("a_b")).is_err());
        let mut variant = named("a");
        variant.preproc.variant = "b".to_string();
        assert_eq!(derive(&variant).unwrap().name(), "a_b");
        variant.preproc.variant = "b c".to_string();
        assert!(derive(&variant).is_err());
    }

    #[test]
    fn test_names_cannot_reach_store_internals() {
        for internal in [".staging", ".scores", ".leases", ".trash", "..", "."] {
            let err = derive(&RunParameters::for_dataset(internal)).unwrap_err();
            assert!(matches!(err, CurationError::InvalidParameter { .. }), "{internal}");
        }
        assert!(derive(&RunParameters::for_dataset("../tuab")).is_err());
    }

    #[test]
    fn test_invalid_rate_and_seed() {
        assert!(matches!(
            derive(&params(true, -0.1, 0)),
            Err(CurationError::InvalidParameter { .. })
        ));
        assert!(matches!(
            derive(&params(true, f64::NAN, 0)),
            Err(CurationError::InvalidParameter { .. })
        ));
        assert!(matches!(
            derive(&params(true, 0.5, -1)),
            Err(CurationError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_stable_across_calls() {
        let p = params(true, 0.25, 31);
        let first = derive(&p).unwrap();
        for _ in 0..5 {
            assert_eq!(derive(&p).unwrap(), first);
        }
    }

    #[test]
    fn test_curated_fingerprints_never_collide() {
        let base = derive(&params(true, 0.5, 12)).unwrap();
        let q20 = FilterPolicy::new(FilterMode::QuantileRemoved, 0.2);
        let q30 = FilterPolicy::new(FilterMode::QuantileRemoved, 0.3);

        let c20 = derive_curated(&base, &q20, "prov").unwrap();
        let c30 = derive_curated(&base, &q30, "prov").unwrap();
        let c20_again = derive_curated(&base, &q20, "prov").unwrap();

        assert_eq!(c20, c20_again);
        assert_ne!(c20, c30);
        assert_ne!(c20.digest(), base.digest());
        assert!(c20.name().starts_with("tuab_dropout_0.5_seed_12__curated_quantile_removed_0.2"));
    }
}
