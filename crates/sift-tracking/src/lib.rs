//! Sift-Tracking: experiment-tracking collaborator
//!
//! Receives one record per pipeline state transition:
//! `{member, fingerprint, state, timestamp, metrics}`.
//!
//! ## Key Components
//!
//! - `ExperimentTracker`: async sink trait
//! - `NoopTracker`: tracking disabled
//! - `JsonlTracker`: append-only JSONL file
//! - `MemoryTracker`: in-memory fake for tests

mod error;
pub mod fakes;
pub mod jsonl;
pub mod tracker;

pub use error::{TrackingError, TrackingResult};
pub use fakes::MemoryTracker;
pub use jsonl::JsonlTracker;
pub use tracker::{ExperimentTracker, NoopTracker, TransitionRecord};
