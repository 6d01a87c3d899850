//! Sample records and dataset splits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::error::CurationError;

/// Dataset split a sample originates from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Eval,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Eval, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Eval => "eval",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = CurationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "eval" | "validation" => Ok(Split::Eval),
            "test" => Ok(Split::Test),
            other => Err(CurationError::invalid(
                "originating_split",
                format!("unknown split '{other}'"),
            )),
        }
    }
}

/// One input unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleRecord {
    pub id: String,
    pub label: String,
    pub originating_split: Split,

    /// Model input. Opaque to the cache and curator.
    #[serde(default)]
    pub features: Vec<f32>,
}

impl SampleRecord {
    pub fn new(id: impl Into<String>, label: impl Into<String>, split: Split) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            originating_split: split,
            features: Vec::new(),
        }
    }

    pub fn with_features(mut self, features: Vec<f32>) -> Self {
        self.features = features;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_parse_accepts_validation_alias() {
        assert_eq!("validation".parse::<Split>().unwrap(), Split::Eval);
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert!("holdout".parse::<Split>().is_err());
    }

    #[test]
    fn test_sample_record_serde_uses_lowercase_split() {
        let record = SampleRecord::new("s-1", "seizure", Split::Test);
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"originating_split\":\"test\""));
    }

    #[test]
    fn test_sample_record_features_default_empty() {
        let record: SampleRecord =
            serde_json::from_str(r#"{"id":"a","label":"x","originating_split":"train"}"#)
                .expect("deserialize");
        assert!(record.features.is_empty());
    }
}
