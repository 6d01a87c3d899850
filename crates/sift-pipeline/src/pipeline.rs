//! Per-member pipeline orchestration.
//!
//! One call to [`PipelineOrchestrator::run`] drives a member through
//! `Init → Preprocessed → Trained → Scored → Curated → Retrained → Evaluated
//! → Done`, stopping in `Failed` on the first error. Members share nothing
//! but the cache store.

use std::fmt;
use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn, Instrument};

use sift_core::obs::{self, MemberSpan};
use sift_core::reporting::{self, Phase, ResultRow};
use sift_core::{
    evaluate_split, fingerprint, CacheEntry, CacheStore, CuratedDataset, CurationError, Curator,
    DropoutPreprocessor, Fingerprint, Partition, Preprocessor, RunParameters, ScoreTable,
    SplitMetrics, Split, Stage, StochasticScorer, METRICS,
};
use sift_tracking::{ExperimentTracker, NoopTracker, TransitionRecord};

use crate::stage::PipelineState;
use crate::trainer::{Checkpoint, ModelRegistry, TrainRequest, Trainer};

/// Why a member ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberFailure {
    pub fingerprint: String,
    pub stage: Stage,
    /// `CurationError::kind` of the cause.
    pub kind: String,
    pub message: String,
}

impl MemberFailure {
    pub fn new(fingerprint: impl Into<String>, stage: Stage, err: &CurationError) -> Self {
        let message = match err {
            CurationError::StageFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            fingerprint: fingerprint.into(),
            stage,
            kind: err.kind().to_string(),
            message,
        }
    }
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for {} ({}): {}",
            self.stage, self.fingerprint, self.kind, self.message
        )
    }
}

/// What a successful member produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReport {
    pub base: Fingerprint,
    pub curated: Fingerprint,
    pub baseline_checkpoint: String,
    pub curated_checkpoint: String,
    /// Whether the score table came from an earlier run.
    pub scores_reused: bool,
    pub retained: usize,
    pub removed: usize,
    pub rows: Vec<ResultRow>,
}

/// Final state of one sweep member.
#[derive(Debug, Clone)]
pub struct MemberOutcome {
    pub member: String,
    pub state: PipelineState,
    /// States entered after `Init`, in order.
    pub transitions: Vec<PipelineState>,
    pub duration_ms: u64,
    pub result: Result<MemberReport, MemberFailure>,
}

impl MemberOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Done
    }

    pub fn report(&self) -> Option<&MemberReport> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&MemberFailure> {
        self.result.as_ref().err()
    }
}

struct MemberRun<'a> {
    member: &'a str,
    state: PipelineState,
    transitions: Vec<PipelineState>,
}

impl MemberRun<'_> {
    fn advance(&mut self, to: PipelineState) {
        debug_assert!(self.state.can_transition(to), "{} -> {}", self.state, to);
        self.state = to;
        self.transitions.push(to);
    }
}

/// Drives sweep members through the pipeline.
pub struct PipelineOrchestrator {
    cache: Arc<CacheStore>,
    preprocessor: Arc<dyn Preprocessor>,
    registry: ModelRegistry,
    tracker: Arc<dyn ExperimentTracker>,
}

impl PipelineOrchestrator {
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            preprocessor: Arc::new(DropoutPreprocessor),
            registry: ModelRegistry::builtin(),
            tracker: Arc::new(NoopTracker),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExperimentTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<dyn ExperimentTracker> {
        &self.tracker
    }

    /// Run one member to `Done` or `Failed`. Never returns an error: failures
    /// are part of the outcome.
    pub async fn run(&self, member: &str, params: &RunParameters) -> MemberOutcome {
        let started = Instant::now();
        let mut run = MemberRun {
            member,
            state: PipelineState::Init,
            transitions: Vec::new(),
        };

        let span = tracing::info_span!("sift.member", member = %member);
        let result = self.drive(&mut run, params).instrument(span).await;

        if let Err(failure) = &result {
            METRICS.inc_members_failed();
            obs::emit_member_failed(member, &failure.kind, failure);
            run.advance(PipelineState::Failed);
            self.track(TransitionRecord::new(
                member,
                &failure.fingerprint,
                PipelineState::Failed.name(),
            ))
            .await;
        }

        MemberOutcome {
            member: member.to_string(),
            state: run.state,
            transitions: run.transitions,
            duration_ms: started.elapsed().as_millis() as u64,
            result,
        }
    }

    async fn drive(
        &self,
        run: &mut MemberRun<'_>,
        params: &RunParameters,
    ) -> Result<MemberReport, MemberFailure> {
        // Everything here is checked before any I/O.
        let (base_fp, trainer) = self
            .prepare(run.member, params)
            .map_err(|e| MemberFailure::new(params.preproc.dataset.as_str(), Stage::Preprocess, &e))?;
        let fail = |stage: Stage, fp: &Fingerprint| {
            let name = fp.name().to_string();
            move |e: CurationError| MemberFailure::new(name, stage, &e)
        };
        let member_dir = params
            .logging
            .output_dir
            .join("members")
            .join(run.member);

        // Preprocess
        let t = self.begin(&base_fp, PipelineState::Preprocessed);
        let base = self
            .preprocess(params, &base_fp)
            .await
            .map_err(fail(Stage::Preprocess, &base_fp))?;
        self.complete(
            run,
            PipelineState::Preprocessed,
            &base_fp,
            t,
            &[
                ("train_records", base.len(Split::Train) as f64),
                ("eval_records", base.len(Split::Eval) as f64),
                ("test_records", base.len(Split::Test) as f64),
            ],
        )
        .await;

        // Train
        let t = self.begin(&base_fp, PipelineState::Trained);
        let baseline = self
            .train(&trainer, Stage::Train, &base, params, member_dir.join("baseline"))
            .await
            .map_err(fail(Stage::Train, &base_fp))?;
        self.complete(run, PipelineState::Trained, &base_fp, t, &metric_pairs(&baseline))
            .await;

        // Score the uncurated train split
        let t = self.begin(&base_fp, PipelineState::Scored);
        let (scores, scores_reused) = self
            .score(&trainer, &baseline, &base, params, run.member)
            .await
            .map_err(fail(Stage::Score, &base_fp))?;
        let mean = if scores.is_empty() {
            0.0
        } else {
            scores.scores().values().map(|s| s.score).sum::<f64>() / scores.len() as f64
        };
        self.complete(
            run,
            PipelineState::Scored,
            &base_fp,
            t,
            &[
                ("samples", scores.len() as f64),
                ("mean_score", mean),
                ("reused", if scores_reused { 1.0 } else { 0.0 }),
            ],
        )
        .await;

        // Curate
        let t = self.begin(&base_fp, PipelineState::Curated);
        let (curated, curated_entry) = self
            .curate(&base, &scores, params)
            .await
            .map_err(fail(Stage::Curate, &base_fp))?;
        self.complete(
            run,
            PipelineState::Curated,
            &curated.fingerprint,
            t,
            &[
                ("retained", curated.len() as f64),
                ("removed", curated.removed.len() as f64),
            ],
        )
        .await;

        // Retrain from scratch on the curated split only
        let t = self.begin(&curated.fingerprint, PipelineState::Retrained);
        let retrained = self
            .train(&trainer, Stage::Retrain, &curated_entry, params, member_dir.join("curated"))
            .await
            .map_err(fail(Stage::Retrain, &curated.fingerprint))?;
        self.complete(
            run,
            PipelineState::Retrained,
            &curated.fingerprint,
            t,
            &metric_pairs(&retrained),
        )
        .await;

        // Evaluate both models on the untouched eval/test splits
        let t = self.begin(&base_fp, PipelineState::Evaluated);
        let rows = self
            .evaluate(&trainer, run.member, params, &base, &baseline, &retrained)
            .await
            .map_err(fail(Stage::Evaluate, &base_fp))?;
        let row_metrics: Vec<(String, f64)> = rows
            .iter()
            .map(|r| (format!("{}_{}_acc", r.phase.as_str(), r.split), r.acc))
            .collect();
        let row_metrics: Vec<(&str, f64)> =
            row_metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        self.complete(run, PipelineState::Evaluated, &base_fp, t, &row_metrics)
            .await;

        run.advance(PipelineState::Done);
        self.track(TransitionRecord::new(
            run.member,
            base_fp.name(),
            PipelineState::Done.name(),
        ))
        .await;
        info!(
            event = "member.done",
            member = %run.member,
            base = %base_fp,
            curated = %curated.fingerprint,
        );

        Ok(MemberReport {
            base: base_fp,
            curated: curated.fingerprint.clone(),
            baseline_checkpoint: baseline.id,
            curated_checkpoint: retrained.id,
            scores_reused,
            retained: curated.len(),
            removed: curated.removed.len(),
            rows,
        })
    }

    fn prepare(
        &self,
        member: &str,
        params: &RunParameters,
    ) -> sift_core::Result<(Fingerprint, Arc<dyn Trainer>)> {
        if member.is_empty() || member.starts_with('.') || member.contains(['/', '\\']) {
            return Err(CurationError::invalid(
                "member",
                format!("'{member}' cannot be used as a directory name"),
            ));
        }
        params.validate()?;
        let trainer = self.registry.create(&params.training.model_type)?;
        Ok((fingerprint::derive(params)?, trainer))
    }

    fn begin(&self, fp: &Fingerprint, state: PipelineState) -> Instant {
        obs::emit_stage_entered(fp.name(), state.name());
        Instant::now()
    }

    async fn complete(
        &self,
        run: &mut MemberRun<'_>,
        state: PipelineState,
        fp: &Fingerprint,
        started: Instant,
        metrics: &[(&str, f64)],
    ) {
        run.advance(state);
        obs::emit_stage_completed(fp.name(), state.name(), started.elapsed().as_millis() as u64);
        let record = metrics.iter().fold(
            TransitionRecord::new(run.member, fp.name(), state.name()),
            |record, (k, v)| record.with_metric(*k, *v),
        );
        self.track(record).await;
    }

    /// Tracking is best effort.
    async fn track(&self, record: TransitionRecord) {
        if let Err(e) = self.tracker.record(record).await {
            warn!(event = "tracking.failed", error = %e);
        }
    }

    async fn preprocess(
        &self,
        params: &RunParameters,
        fp: &Fingerprint,
    ) -> sift_core::Result<CacheEntry> {
        if params.cache.clean_before_build && self.cache.invalidate(fp)? {
            info!(fingerprint = %fp, "cleaned cache entry before build");
        }
        let source = serde_json::to_value(&params.preproc)?;
        self.get_or_rebuild(fp, source, params.cache.rebuild_stale, || {
            self.base_builder(params, fp)
        })
        .await
    }

    /// `get_or_create`, retried once after invalidation when the entry is
    /// stale and `rebuild_stale` is set. `builder` makes a fresh build closure
    /// per attempt.
    async fn get_or_rebuild<B, F, Fut>(
        &self,
        fp: &Fingerprint,
        source: serde_json::Value,
        rebuild_stale: bool,
        builder: B,
    ) -> sift_core::Result<CacheEntry>
    where
        B: Fn() -> F,
        F: FnOnce() -> Fut,
        Fut: Future<Output = sift_core::Result<Vec<Partition>>>,
    {
        match self.cache.get_or_create(fp, source.clone(), builder()).await {
            Err(CurationError::StaleCache { reason, .. }) if rebuild_stale => {
                warn!(fingerprint = %fp, reason = %reason, "rebuilding stale cache entry");
                self.cache.invalidate(fp)?;
                self.cache.get_or_create(fp, source, builder()).await
            }
            other => other,
        }
    }

    fn base_builder(
        &self,
        params: &RunParameters,
        fp: &Fingerprint,
    ) -> impl FnOnce() -> BoxFuture<'static, sift_core::Result<Vec<Partition>>> {
        let preprocessor = Arc::clone(&self.preprocessor);
        let config = params.preproc.clone();
        let name = fp.name().to_string();
        move || -> BoxFuture<'static, sift_core::Result<Vec<Partition>>> {
            Box::pin(async move {
                match tokio::task::spawn_blocking(move || preprocessor.preprocess(&config)).await {
                    Ok(built) => {
                        built.map_err(|e| CurationError::stage_failure(&name, Stage::Preprocess, &e))
                    }
                    Err(e) => Err(CurationError::stage_failure(
                        &name,
                        Stage::Preprocess,
                        &anyhow::Error::new(e),
                    )),
                }
            })
        }
    }

    async fn train(
        &self,
        trainer: &Arc<dyn Trainer>,
        stage: Stage,
        dataset: &CacheEntry,
        params: &RunParameters,
        checkpoint_dir: PathBuf,
    ) -> sift_core::Result<Checkpoint> {
        let stage_failure =
            |e: anyhow::Error| CurationError::stage_failure(dataset.fingerprint.name(), stage, &e);
        // A trainer never sees a checkpoint from an earlier run.
        match tokio::fs::remove_dir_all(&checkpoint_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(stage_failure(anyhow::Error::new(e))),
        }
        trainer
            .train(TrainRequest {
                dataset: dataset.clone(),
                config: params.training.clone(),
                checkpoint_dir,
            })
            .await
            .map_err(stage_failure)
    }

    /// Score `base`'s train split with `checkpoint`, reusing a stored table
    /// with the same provenance.
    async fn score(
        &self,
        trainer: &Arc<dyn Trainer>,
        checkpoint: &Checkpoint,
        base: &CacheEntry,
        params: &RunParameters,
        member: &str,
    ) -> sift_core::Result<(ScoreTable, bool)> {
        let scorer = StochasticScorer::from_config(&params.scoring)?;
        let provenance = scorer.provenance_digest(&checkpoint.id, &base.fingerprint)?;
        let path = self.cache.score_path(&provenance);
        let stage_failure =
            |e: anyhow::Error| CurationError::stage_failure(base.fingerprint.name(), Stage::Score, &e);

        if path.exists() {
            match ScoreTable::load(&path) {
                Ok(table) if table.matches(&scorer, &checkpoint.id, &base.fingerprint) => {
                    info!(event = "score.reused", dataset = %base.fingerprint, checkpoint = %checkpoint.id);
                    return Ok((table, true));
                }
                outcome => {
                    let reason = match outcome {
                        Ok(_) => "provenance mismatch".to_string(),
                        Err(e) => e.to_string(),
                    };
                    if !params.cache.rebuild_stale {
                        return Err(CurationError::StaleCache {
                            fingerprint: base.fingerprint.name().to_string(),
                            reason: format!("score table {}: {reason}", path.display()),
                        });
                    }
                    warn!(path = %path.display(), reason = %reason, "discarding stored score table");
                    fs::remove_file(&path)?;
                }
            }
        }

        let engine = trainer.load(checkpoint).await.map_err(stage_failure)?;
        let entry = base.clone();
        let member = member.to_string();
        let table = tokio::task::spawn_blocking(move || -> sift_core::Result<ScoreTable> {
            let _span = MemberSpan::enter(&member, entry.fingerprint.name());
            let records = entry.load(Split::Train)?;
            scorer.score(engine.as_ref(), &entry.fingerprint, &records)
        })
        .await
        .map_err(|e| stage_failure(anyhow::Error::new(e)))??;

        match table.persist(&path) {
            Ok(()) => Ok((table, false)),
            // A concurrent member with the same provenance got there first.
            Err(CurationError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                Ok((ScoreTable::load(&path)?, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Filter the scored train split and materialize it as its own entry.
    async fn curate(
        &self,
        base: &CacheEntry,
        scores: &ScoreTable,
        params: &RunParameters,
    ) -> sift_core::Result<(CuratedDataset, CacheEntry)> {
        let curated = Curator::filter(scores, &params.curation)?;
        let source = json!({
            "base": base.fingerprint.name(),
            "base_digest": base.fingerprint.digest(),
            "policy": params.curation,
            "score_provenance": scores.provenance_digest()?,
            "removed": curated.removed.iter().map(|s| &s.sample_id).collect::<Vec<_>>(),
        });

        let name = curated.fingerprint.name().to_string();
        let curated_builder = || {
            let entry = base.clone();
            let view = curated.clone();
            let name = name.clone();
            move || async move {
                let copied = tokio::task::spawn_blocking(move || {
                    Split::ALL
                        .iter()
                        .map(|split| -> sift_core::Result<Partition> {
                            let records = entry.load(*split)?;
                            let records = match split {
                                Split::Train => view.apply(records),
                                _ => records,
                            };
                            Ok(Partition::new(*split, records))
                        })
                        .collect::<sift_core::Result<Vec<Partition>>>()
                })
                .await;
                match copied {
                    Ok(partitions) => partitions,
                    Err(e) => Err(CurationError::stage_failure(
                        &name,
                        Stage::Curate,
                        &anyhow::Error::new(e),
                    )),
                }
            }
        };
        let curated_entry = self
            .get_or_rebuild(
                &curated.fingerprint,
                source,
                params.cache.rebuild_stale,
                curated_builder,
            )
            .await?;
        Ok((curated, curated_entry))
    }

    async fn evaluate(
        &self,
        trainer: &Arc<dyn Trainer>,
        member: &str,
        params: &RunParameters,
        base: &CacheEntry,
        baseline: &Checkpoint,
        retrained: &Checkpoint,
    ) -> sift_core::Result<Vec<ResultRow>> {
        let stage_failure =
            |e: anyhow::Error| CurationError::stage_failure(base.fingerprint.name(), Stage::Evaluate, &e);
        let dropout_rate = if params.preproc.dropout_active() {
            params.preproc.dropout_rate
        } else {
            0.0
        };

        let mut rows = Vec::new();
        for (phase, checkpoint) in [(Phase::Baseline, baseline), (Phase::Curated, retrained)] {
            let engine = trainer.load(checkpoint).await.map_err(stage_failure)?;
            let entry = base.clone();
            let metrics = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<SplitMetrics>> {
                [Split::Eval, Split::Test]
                    .iter()
                    .map(|split| {
                        let records = entry.load(*split)?;
                        evaluate_split(engine.as_ref(), *split, &records)
                    })
                    .collect()
            })
            .await
            .map_err(|e| stage_failure(anyhow::Error::new(e)))?
            .map_err(stage_failure)?;

            rows.extend(metrics.into_iter().filter(|m| m.samples > 0).map(|m| ResultRow {
                member: member.to_string(),
                model: params.training.model_type.clone(),
                dataset: params.preproc.dataset.clone(),
                seed: params.preproc.dropout_seed as u64,
                dropout_rate,
                phase,
                split: m.split,
                acc: m.acc,
                balanced_acc: m.balanced_acc,
            }));
        }

        let path = reporting::results_path(&params.logging.output_dir, member);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        reporting::append_results(&path, &rows).map_err(stage_failure)?;
        Ok(rows)
    }
}

fn metric_pairs(checkpoint: &Checkpoint) -> Vec<(&str, f64)> {
    checkpoint
        .metrics
        .iter()
        .map(|(k, v)| (k.as_str(), *v))
        .collect()
}
