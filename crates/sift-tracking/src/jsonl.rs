//! Append-only JSONL tracker.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{TrackingError, TrackingResult};
use crate::tracker::{ExperimentTracker, TransitionRecord};

/// Writes one JSON object per line. Lines from concurrent members never
/// interleave because every write holds the file lock.
#[derive(Debug)]
pub struct JsonlTracker {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTracker {
    /// Open `path` for appending, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> TrackingResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "tracking to jsonl");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in `path`.
    pub async fn read_all(path: impl AsRef<Path>) -> TrackingResult<Vec<TransitionRecord>> {
        let text = fs::read_to_string(path).await?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<TransitionRecord>(l).map_err(TrackingError::from))
            .collect()
    }
}

#[async_trait]
impl ExperimentTracker for JsonlTracker {
    async fn record(&self, record: TransitionRecord) -> TrackingResult<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> TrackingResult<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}
