//! Per-member pipeline states.

use serde::{Deserialize, Serialize};
use sift_core::Stage;
use std::fmt;

/// Lifecycle of one sweep member.
///
/// Forward order is `Init → Preprocessed → Trained → Scored → Curated →
/// Retrained → Evaluated → Done`. `Failed` is terminal and reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Preprocessed,
    Trained,
    Scored,
    Curated,
    Retrained,
    Evaluated,
    Done,
    Failed,
}

impl PipelineState {
    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::Preprocessed => "preprocessed",
            PipelineState::Trained => "trained",
            PipelineState::Scored => "scored",
            PipelineState::Curated => "curated",
            PipelineState::Retrained => "retrained",
            PipelineState::Evaluated => "evaluated",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }

    /// The successor on the success path, `None` for terminal states.
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Init => Some(PipelineState::Preprocessed),
            PipelineState::Preprocessed => Some(PipelineState::Trained),
            PipelineState::Trained => Some(PipelineState::Scored),
            PipelineState::Scored => Some(PipelineState::Curated),
            PipelineState::Curated => Some(PipelineState::Retrained),
            PipelineState::Retrained => Some(PipelineState::Evaluated),
            PipelineState::Evaluated => Some(PipelineState::Done),
            PipelineState::Done | PipelineState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition(&self, to: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == PipelineState::Failed || self.next() == Some(to)
    }

    /// The work that moves a member into this state.
    pub fn work(&self) -> Option<Stage> {
        match self {
            PipelineState::Preprocessed => Some(Stage::Preprocess),
            PipelineState::Trained => Some(Stage::Train),
            PipelineState::Scored => Some(Stage::Score),
            PipelineState::Curated => Some(Stage::Curate),
            PipelineState::Retrained => Some(Stage::Retrain),
            PipelineState::Evaluated => Some(Stage::Evaluate),
            PipelineState::Init | PipelineState::Done | PipelineState::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
