//! Tracker trait definitions.
//!
//! The pipeline reports one `TransitionRecord` per state change of a sweep
//! member. Tracking is best effort: callers log and continue when a backend
//! fails, so a missing or broken tracker never changes a run's outcome.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingResult;

/// One pipeline state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Sweep member name
    pub member: String,
    /// Fingerprint of the dataset the stage worked on
    pub fingerprint: String,
    /// State entered, e.g. "preprocessed"
    pub state: String,
    pub timestamp: DateTime<Utc>,
    /// Key metrics for the stage (record counts, accuracy, ...)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl TransitionRecord {
    pub fn new(
        member: impl Into<String>,
        fingerprint: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            member: member.into(),
            fingerprint: fingerprint.into(),
            state: state.into(),
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

/// Experiment-tracking sink.
///
/// Implementations must be safe to share between concurrently running sweep
/// members; records from one member arrive in transition order.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn record(&self, record: TransitionRecord) -> TrackingResult<()>;

    /// Make previously recorded transitions durable.
    async fn flush(&self) -> TrackingResult<()> {
        Ok(())
    }
}

/// Tracker used when tracking is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

#[async_trait]
impl ExperimentTracker for NoopTracker {
    async fn record(&self, _record: TransitionRecord) -> TrackingResult<()> {
        Ok(())
    }
}
