//! Bounded sweep execution.
//!
//! Every member is spawned as its own task; a semaphore caps how many run at
//! once. A member that fails (or whose task dies) is recorded and its
//! siblings keep going.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use sift_core::{obs, CurationError, Stage, METRICS};

use crate::pipeline::{MemberFailure, MemberOutcome, PipelineOrchestrator};
use crate::stage::PipelineState;
use crate::sweep::SweepMember;

/// Configuration for a sweep batch.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Maximum number of members in flight.
    pub max_concurrent: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// Aggregated member outcomes, sorted by member name.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub outcomes: Vec<MemberOutcome>,
    pub duration_ms: u64,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &MemberOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(MemberOutcome::succeeded)
    }

    /// Process exit code: 0 only when every member reached `Done`.
    pub fn exit_code(&self) -> i32 {
        if self.all_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, member: &str) -> Option<&MemberOutcome> {
        self.outcomes.iter().find(|o| o.member == member)
    }
}

/// Runs expanded sweep members against one orchestrator.
pub struct SweepRunner {
    orchestrator: Arc<PipelineOrchestrator>,
    config: SweepConfig,
}

impl SweepRunner {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, config: SweepConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    #[instrument(skip_all, fields(members = members.len(), max_concurrent = self.config.max_concurrent))]
    pub async fn run(&self, members: Vec<SweepMember>) -> SweepReport {
        let started = Instant::now();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        let mut outcomes = Vec::new();
        let mut tasks = Vec::with_capacity(members.len());
        for member in members {
            let params = match member.params {
                Ok(params) => params,
                Err(failure) => {
                    outcomes.push(unresolved(member.name, failure));
                    continue;
                }
            };
            let orchestrator = Arc::clone(&self.orchestrator);
            let sem = Arc::clone(&sem);
            let name = member.name;
            let dataset = params.preproc.dataset.clone();
            let assignments = member.assignments;

            let task_name = name.clone();
            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                if !assignments.is_empty() {
                    info!(member = %task_name, assignments = ?assignments, "sweep.member.start");
                }
                orchestrator.run(&task_name, &params).await
            });
            tasks.push((name, dataset, task));
        }

        for (name, dataset, task) in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(member = %name, error = %e, "sweep member task aborted");
                    outcomes.push(aborted(name, dataset, &e));
                }
            }
        }
        outcomes.sort_by(|a, b| a.member.cmp(&b.member));

        let report = SweepReport {
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let failed = report.total() - report.succeeded();
        obs::emit_sweep_finished(report.total(), failed, report.duration_ms);
        METRICS.flush();
        if let Err(e) = self.orchestrator.tracker().flush().await {
            warn!(error = %e, "tracker flush failed");
        }
        report
    }
}

/// Outcome for a member whose task panicked or was cancelled.
///
/// The orchestrator never got to report a stage, so the failure is pinned to
/// the first one.
fn aborted(member: String, dataset: String, err: &tokio::task::JoinError) -> MemberOutcome {
    METRICS.inc_members_failed();
    let cause = CurationError::StageFailure {
        fingerprint: dataset.clone(),
        stage: Stage::Preprocess,
        message: format!("member task aborted: {err}"),
    };
    obs::emit_member_failed(&member, cause.kind(), &cause);
    MemberOutcome {
        member,
        state: PipelineState::Failed,
        transitions: vec![PipelineState::Failed],
        duration_ms: 0,
        result: Err(MemberFailure::new(dataset, Stage::Preprocess, &cause)),
    }
}

/// Outcome for a member whose parameters never resolved. It fails without
/// running; nothing was built for it.
fn unresolved(member: String, failure: MemberFailure) -> MemberOutcome {
    METRICS.inc_members_failed();
    obs::emit_member_failed(&member, &failure.kind, &failure);
    MemberOutcome {
        member,
        state: PipelineState::Failed,
        transitions: vec![PipelineState::Failed],
        duration_ms: 0,
        result: Err(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only `state` matters to the report accessors.
    fn outcome(member: &str, state: PipelineState) -> MemberOutcome {
        MemberOutcome {
            member: member.to_string(),
            state,
            transitions: vec![state],
            duration_ms: 1,
            result: Err(MemberFailure {
                fingerprint: "tuab".to_string(),
                stage: Stage::Train,
                kind: "stage_failure".to_string(),
                message: "boom".to_string(),
            }),
        }
    }

    #[test]
    fn test_exit_code_zero_only_when_all_done() {
        let ok = SweepReport {
            outcomes: vec![outcome("a", PipelineState::Done), outcome("b", PipelineState::Done)],
            duration_ms: 0,
        };
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(ok.succeeded(), 2);

        let mixed = SweepReport {
            outcomes: vec![outcome("a", PipelineState::Done), outcome("b", PipelineState::Failed)],
            duration_ms: 0,
        };
        assert_eq!(mixed.exit_code(), 1);
        assert_eq!(mixed.failed().count(), 1);
        assert_eq!(mixed.outcome("b").map(|o| o.state), Some(PipelineState::Failed));
    }

    #[test]
    fn test_empty_report_succeeds() {
        let report = SweepReport {
            outcomes: Vec::new(),
            duration_ms: 0,
        };
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_default_concurrency() {
        assert_eq!(SweepConfig::default().max_concurrent, 4);
    }
}
