//! Pipeline stages, used to attribute work and failures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A unit of work inside one sweep member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    Train,
    Score,
    Curate,
    Retrain,
    Evaluate,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Train => "train",
            Stage::Score => "score",
            Stage::Curate => "curate",
            Stage::Retrain => "retrain",
            Stage::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
