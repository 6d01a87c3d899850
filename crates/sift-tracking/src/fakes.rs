//! In-memory fakes for the tracker trait (testing only)
//!
//! `MemoryTracker` keeps records in a `Vec` and can be switched into a
//! failing mode to exercise best-effort tracking.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{TrackingError, TrackingResult};
use crate::tracker::{ExperimentTracker, TransitionRecord};

#[derive(Debug, Default)]
pub struct MemoryTracker {
    records: Mutex<Vec<TransitionRecord>>,
    failing: bool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker whose every call fails with `Unavailable`.
    pub fn failing() -> Self {
        Self {
            records: Mutex::default(),
            failing: true,
        }
    }

    /// All records, in arrival order.
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// States recorded for `member`, in order.
    pub fn states_for(&self, member: &str) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.member == member)
            .map(|r| r.state)
            .collect()
    }
}

#[async_trait]
impl ExperimentTracker for MemoryTracker {
    async fn record(&self, record: TransitionRecord) -> TrackingResult<()> {
        if self.failing {
            return Err(TrackingError::Unavailable("memory tracker set to fail".into()));
        }
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
        Ok(())
    }
}
