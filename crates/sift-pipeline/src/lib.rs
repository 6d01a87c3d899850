//! sift pipeline - curation runs over fingerprinted datasets
//!
//! Provides:
//! - the per-member state machine (`PipelineOrchestrator`)
//! - the `Trainer` collaborator and its model registry
//! - sweep expansion and a bounded sweep runner

pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod sweep;
pub mod trainer;

// Re-export key types
pub use pipeline::{MemberFailure, MemberOutcome, MemberReport, PipelineOrchestrator};
pub use runner::{SweepConfig, SweepReport, SweepRunner};
pub use stage::PipelineState;
pub use sweep::{SweepMember, SweepSpec};
pub use trainer::{CentroidTrainer, Checkpoint, ModelRegistry, TrainRequest, Trainer, CENTROID_MODEL};
