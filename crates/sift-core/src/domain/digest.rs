//! Canonical JSON encoding and SHA-256 digests.
//!
//! Fingerprints and curated-set identities are hashes of a canonical encoding,
//! so the encoding must not depend on field order or on how a number was
//! spelled in a config file:
//! - object keys are sorted by UTF-16 code units
//! - integer-valued floats are written as integers
//! - NaN and infinities are rejected

use crate::domain::error::{CurationError, Result};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(canonicalize).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            let f = n.as_f64().unwrap_or(f64::NAN);
            if !f.is_finite() {
                return Err(CurationError::invalid(
                    "canonical_json",
                    "NaN/Infinity cannot be fingerprinted",
                ));
            }
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(Value::Number(Number::from(f as i64)))
            } else {
                Ok(Value::Number(n.clone()))
            }
        }
        other => Ok(other.clone()),
    }
}

/// Compact canonical JSON text for `value`.
pub fn canonical_json(value: &Value) -> Result<String> {
    let canonical = canonicalize(value)?;
    Ok(serde_json::to_string(&canonical)?)
}

/// SHA-256 hex digest of the canonical encoding of `value`.
pub fn compute_digest(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_does_not_change_encoding() {
        let a = json!({"dataset": "tuab", "dropout": {"rate": 0.5, "seed": 12}});
        let b = json!({"dropout": {"seed": 12, "rate": 0.5}, "dataset": "tuab"});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_integer_valued_float_collapses() {
        let spelled_float = json!({"seed": 12.0});
        let spelled_int = json!({"seed": 12});
        assert_eq!(canonical_json(&spelled_float).unwrap(), r#"{"seed":12}"#);
        assert_eq!(
            compute_digest(&spelled_float).unwrap(),
            compute_digest(&spelled_int).unwrap()
        );
    }

    #[test]
    fn test_fractional_float_preserved() {
        let input = json!({"rate": 0.3});
        assert_eq!(canonical_json(&input).unwrap(), r#"{"rate":0.3}"#);
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = json!({"splits": ["train", "test"]});
        let b = json!({"splits": ["test", "train"]});
        assert_ne!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let digest = compute_digest(&json!({"dataset": "tuab"})).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
