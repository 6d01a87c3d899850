//! Trainer collaborator and the model registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::{
    evaluate_split, CacheEntry, CentroidModel, CurationError, InferenceEngine, Split,
    TrainingConfig,
};

/// Handle to a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Stable identifier; scores are keyed by it.
    pub id: String,
    pub model_type: String,
    pub path: PathBuf,
    /// Key training metrics, forwarded to the tracker.
    pub metrics: BTreeMap<String, f64>,
}

/// Everything a trainer needs for one run.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Trains on the `train` partition of this entry.
    pub dataset: CacheEntry,
    pub config: TrainingConfig,
    /// Cleared before training; the trainer writes its checkpoint here.
    pub checkpoint_dir: PathBuf,
}

/// External training collaborator.
///
/// Every `train` call starts from freshly initialized parameters; nothing is
/// carried over from an earlier checkpoint.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, request: TrainRequest) -> anyhow::Result<Checkpoint>;

    /// Load a checkpoint for inference.
    async fn load(&self, checkpoint: &Checkpoint) -> anyhow::Result<Arc<dyn InferenceEngine>>;
}

/// Trainer for the built-in `centroid` model.
#[derive(Debug, Default, Clone, Copy)]
pub struct CentroidTrainer;

pub const CENTROID_MODEL: &str = "centroid";

#[async_trait]
impl Trainer for CentroidTrainer {
    async fn train(&self, request: TrainRequest) -> anyhow::Result<Checkpoint> {
        tokio::task::spawn_blocking(move || {
            let records = request.dataset.load(Split::Train)?;
            let model = CentroidModel::fit(&records, request.config.inference_dropout)
                .with_context(|| format!("fit on {}", request.dataset.fingerprint))?;

            if request.checkpoint_dir.exists() {
                fs::remove_dir_all(&request.checkpoint_dir)?;
            }
            let path = request.checkpoint_dir.join("model.json");
            model.save(&path)?;

            let fit = evaluate_split(&model, Split::Train, &records)?;
            debug!(checkpoint = model.checkpoint_id(), samples = records.len(), "centroid trained");
            Ok(Checkpoint {
                id: model.checkpoint_id().to_string(),
                model_type: CENTROID_MODEL.to_string(),
                path,
                metrics: BTreeMap::from([
                    ("train_samples".to_string(), records.len() as f64),
                    ("train_acc".to_string(), fit.acc),
                ]),
            })
        })
        .await?
    }

    async fn load(&self, checkpoint: &Checkpoint) -> anyhow::Result<Arc<dyn InferenceEngine>> {
        let path = checkpoint.path.clone();
        let model = tokio::task::spawn_blocking(move || CentroidModel::load(&path)).await??;
        anyhow::ensure!(
            model.checkpoint_id() == checkpoint.id,
            "checkpoint {} holds model {}",
            checkpoint.path.display(),
            model.checkpoint_id()
        );
        Ok(Arc::new(model))
    }
}

type TrainerFactory = Arc<dyn Fn() -> Arc<dyn Trainer> + Send + Sync>;

/// Maps `training.model_type` to a trainer.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, TrainerFactory>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in models.
    pub fn builtin() -> Self {
        Self::empty().register(CENTROID_MODEL, || Arc::new(CentroidTrainer) as Arc<dyn Trainer>)
    }

    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Trainer> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Registered model types, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> sift_core::Result<Arc<dyn Trainer>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                CurationError::invalid(
                    "training.model_type",
                    format!("unknown model '{name}', available: {}", self.names().join(", ")),
                )
            })
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names())
            .finish()
    }
}
