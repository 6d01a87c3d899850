//! Fingerprint-keyed dataset cache.
//!
//! One directory per fingerprint under the store root. Entries are built in a
//! private staging directory and published with a single rename, so readers
//! only ever see complete entries. Builds for the same fingerprint are
//! serialized twice over: an in-process async mutex per fingerprint, and a
//! lease file for builders in other processes.

mod lease;
mod manifest;

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use manifest::{CacheManifest, Partition, PartitionManifest, MANIFEST_FILE, PARTITION_SCHEMA};

use crate::domain::error::{CurationError, Result};
use crate::domain::params::CacheConfig;
use crate::domain::sample::{SampleRecord, Split};
use crate::fingerprint::Fingerprint;
use crate::metrics::METRICS;
use lease::{Lease, LeaseTiming};

const STAGING_DIR: &str = ".staging";
const TRASH_DIR: &str = ".trash";
const LEASE_DIR: &str = ".leases";
const SCORES_DIR: &str = ".scores";

/// What a caller does when another builder holds the same fingerprint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Wait for the other build, then reuse its entry.
    #[default]
    Wait,
    /// Return `Busy` right away.
    FailFast,
}

/// A verified, published cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub location: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source_parameters: serde_json::Value,
    pub valid: bool,
    pub manifest: CacheManifest,
}

impl CacheEntry {
    fn from_manifest(location: PathBuf, manifest: CacheManifest) -> Self {
        Self {
            fingerprint: manifest.fingerprint.clone(),
            location,
            created_at: manifest.created_at,
            source_parameters: manifest.source_parameters.clone(),
            valid: true,
            manifest,
        }
    }

    pub fn partition_path(&self, split: Split) -> PathBuf {
        let file = self
            .manifest
            .partition(split)
            .map(|p| p.file.clone())
            .unwrap_or_else(|| format!("{split}.jsonl"));
        self.location.join(file)
    }

    /// Number of records the manifest lists for `split`.
    pub fn len(&self, split: Split) -> usize {
        self.manifest.partition(split).map(|p| p.records).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.total_records() == 0
    }

    /// Read one partition back into memory.
    pub fn load(&self, split: Split) -> Result<Vec<SampleRecord>> {
        if self.manifest.partition(split).is_none() {
            return Ok(Vec::new());
        }
        manifest::read_partition(&self.partition_path(split))
    }
}

/// Listing row for `CacheStore::list`.
#[derive(Debug, Clone)]
pub enum EntryStatus {
    Valid(Box<CacheEntry>),
    Stale {
        name: String,
        location: PathBuf,
        reason: String,
    },
}

/// Filesystem-backed dataset cache.
pub struct CacheStore {
    root: PathBuf,
    policy: LockPolicy,
    lease: LeaseTiming,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CacheStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [STAGING_DIR, TRASH_DIR, LEASE_DIR, SCORES_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            policy: LockPolicy::Wait,
            lease: LeaseTiming {
                stale_after: Duration::from_secs(600),
                wait: Duration::from_secs(3600),
                poll: Duration::from_millis(200),
            },
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        Ok(Self::open(&config.root)?
            .with_lock_policy(config.lock)
            .with_lease_timeout(Duration::from_secs(config.lease_timeout_secs))
            .with_lease_wait(Duration::from_secs(config.lease_wait_secs)))
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Age after which another process's lease counts as abandoned. Held
    /// leases are refreshed well within this.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease.stale_after = timeout;
        self
    }

    /// How long [`LockPolicy::Wait`] waits on a live lease before `Busy`.
    pub fn with_lease_wait(mut self, wait: Duration) -> Self {
        self.lease.wait = wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.lease.poll = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.name())
    }

    /// Where the score table with this provenance digest is kept.
    pub fn score_path(&self, provenance: &str) -> PathBuf {
        self.root.join(SCORES_DIR).join(format!("{provenance}.json"))
    }

    /// Whether a published entry exists. Does not verify partitions.
    pub fn exists(&self, fingerprint: &Fingerprint) -> bool {
        self.entry_dir(fingerprint).join(MANIFEST_FILE).is_file()
    }

    /// Look up and verify an entry.
    ///
    /// `Ok(None)` when nothing is cached. A directory that disagrees with its
    /// manifest, or has none, is reported as `StaleCache` and left untouched.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let location = self.entry_dir(fingerprint);
        if !location.exists() {
            return Ok(None);
        }
        let stale = |reason: String| CurationError::StaleCache {
            fingerprint: fingerprint.name().to_string(),
            reason,
        };

        let manifest = manifest::read_manifest(&location).map_err(stale)?;
        if manifest.fingerprint.digest() != fingerprint.digest() {
            return Err(stale(format!(
                "directory holds digest {} but {} was requested",
                manifest.fingerprint.short(),
                fingerprint.short()
            )));
        }
        manifest::verify(&location, &manifest).map_err(stale)?;
        Ok(Some(CacheEntry::from_manifest(location, manifest)))
    }

    /// Return the entry for `fingerprint`, building it with `builder` if absent.
    ///
    /// At most one build runs per fingerprint. An existing valid entry is
    /// returned without calling `builder`; a stale one is surfaced as an error.
    /// If the returned future is dropped mid-build, the staging directory and
    /// the lease are removed and nothing is published.
    pub async fn get_or_create<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        source_parameters: serde_json::Value,
        builder: F,
    ) -> Result<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Partition>>>,
    {
        if let Some(entry) = self.get(fingerprint)? {
            return Ok(self.hit(entry));
        }

        // Declared before the guard so the guard's reference is gone when the
        // slot checks for other holders.
        let slot = self.lock_for(fingerprint.name());
        let lock = Arc::clone(&slot.lock);
        let _guard = match self.policy {
            LockPolicy::Wait => lock.lock_owned().await,
            LockPolicy::FailFast => lock.try_lock_owned().map_err(|_| CurationError::Busy {
                fingerprint: fingerprint.name().to_string(),
            })?,
        };
        let lease_path = self
            .root
            .join(LEASE_DIR)
            .join(format!("{}.lease", fingerprint.name()));
        let _lease = Lease::acquire(&lease_path, fingerprint.name(), self.policy, self.lease).await?;

        // Someone may have published while we waited.
        if let Some(entry) = self.get(fingerprint)? {
            return Ok(self.hit(entry));
        }

        let started = Instant::now();
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}.", fingerprint.name()))
            .tempdir_in(self.root.join(STAGING_DIR))?;
        debug!(fingerprint = %fingerprint, staging = %staging.path().display(), "building cache entry");

        let partitions = builder().await?;

        let stage_path = staging.path().to_path_buf();
        let fp = fingerprint.clone();
        let manifest = tokio::task::spawn_blocking(move || {
            manifest::materialize(&stage_path, &fp, source_parameters, &partitions)
        })
        .await
        .map_err(|e| CurationError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let location = self.entry_dir(fingerprint);
        fs::rename(staging.path(), &location)?;
        // The staging path is gone; TempDir's cleanup on drop is a no-op now.
        drop(staging);

        METRICS.inc_cache_builds();
        crate::obs::emit_cache_built(
            fingerprint.name(),
            manifest.total_records(),
            started.elapsed().as_millis() as u64,
        );
        Ok(CacheEntry::from_manifest(location, manifest))
    }

    /// Remove the entry for `fingerprint`. Returns whether anything was removed.
    ///
    /// The directory is first renamed out of the namespace, so a concurrent
    /// reader sees either the whole entry or nothing.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.invalidate_by_name(fingerprint.name())
    }

    /// Same as [`CacheStore::invalidate`], addressed by directory name.
    pub fn invalidate_by_name(&self, name: &str) -> Result<bool> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(CurationError::invalid("cache entry", format!("'{name}' is not an entry name")));
        }
        let location = self.root.join(name);
        if !location.exists() {
            return Ok(false);
        }
        let tomb = self.root.join(TRASH_DIR).join(format!("{name}.{}", Uuid::new_v4()));
        fs::rename(&location, &tomb)?;
        if let Err(e) = fs::remove_dir_all(&tomb) {
            warn!(path = %tomb.display(), error = %e, "invalidated entry left in trash");
        }
        crate::obs::emit_cache_invalidated(name);
        Ok(true)
    }

    /// Every entry directory with its verification status, sorted by name.
    pub fn list(&self) -> Result<Vec<EntryStatus>> {
        let mut out = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !dirent.file_type()?.is_dir() {
                continue;
            }
            let location = dirent.path();
            let status = match manifest::read_manifest(&location)
                .and_then(|m| manifest::verify(&location, &m).map(|_| m))
            {
                Ok(m) => EntryStatus::Valid(Box::new(CacheEntry::from_manifest(location, m))),
                Err(reason) => EntryStatus::Stale {
                    name,
                    location,
                    reason,
                },
            };
            out.push(status);
        }
        out.sort_by(|a, b| status_name(a).cmp(status_name(b)));
        Ok(out)
    }

    fn hit(&self, entry: CacheEntry) -> CacheEntry {
        METRICS.inc_cache_hits();
        crate::obs::emit_cache_hit(entry.fingerprint.name());
        entry
    }

    fn lock_for(&self, name: &str) -> LockSlot<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        LockSlot {
            locks: &self.locks,
            name: name.to_string(),
            lock: Arc::clone(locks.entry(name.to_string()).or_default()),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// A handle on one fingerprint's build mutex. The map entry is dropped with
/// the last handle.
struct LockSlot<'a> {
    locks: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    name: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for LockSlot<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        // The map's reference plus ours.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.name);
        }
    }
}

fn status_name(status: &EntryStatus) -> &str {
    match status {
        EntryStatus::Valid(entry) => entry.fingerprint.name(),
        EntryStatus::Stale { name, .. } => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;
    use crate::RunParameters;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn fp(rate: f64, seed: i64) -> Fingerprint {
        fingerprint::derive(&RunParameters::for_dataset("tuab").with_dropout(true, rate, seed))
            .unwrap()
    }

    fn records(n: usize, tag: &str) -> Vec<Partition> {
        Partition::group(
            (0..n).map(|i| SampleRecord::new(format!("{tag}-{i}"), "x", Split::Train)),
        )
    }

    #[tokio::test]
    async fn test_build_then_reuse() {
        let (_dir, store) = make_store();
        let fp = fp(0.5, 12);
        let calls = AtomicUsize::new(0);

        let first = store
            .get_or_create(&fp, serde_json::json!({"rate": 0.5}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(records(4, "first"))
            })
            .await
            .unwrap();
        let second = store
            .get_or_create(&fp, serde_json::json!({"rate": 0.5}), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(records(9, "second"))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(second.len(Split::Train), 4);
        assert!(store.exists(&fp));
        assert!(first.location.ends_with("tuab_dropout_0.5_seed_12"));
    }

    #[tokio::test]
    async fn test_failed_build_publishes_nothing() {
        let (dir, store) = make_store();
        let fp = fp(0.3, 1);

        let result = store
            .get_or_create(&fp, serde_json::Value::Null, || async {
                Err(CurationError::invalid("source", "unreadable"))
            })
            .await;
        assert!(result.is_err());
        assert!(!store.exists(&fp));
        assert_eq!(fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join(LEASE_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_tampered_entry_is_stale_not_served() {
        let (_dir, store) = make_store();
        let fp = fp(0.5, 2);
        let entry = store
            .get_or_create(&fp, serde_json::Value::Null, || async { Ok(records(3, "a")) })
            .await
            .unwrap();

        fs::write(entry.partition_path(Split::Train), b"").unwrap();

        assert!(matches!(store.get(&fp), Err(CurationError::StaleCache { .. })));
        let again = store
            .get_or_create(&fp, serde_json::Value::Null, || async { Ok(records(3, "b")) })
            .await;
        assert!(matches!(again, Err(CurationError::StaleCache { .. })));

        assert!(store.invalidate(&fp).unwrap());
        let rebuilt = store
            .get_or_create(&fp, serde_json::Value::Null, || async { Ok(records(5, "c")) })
            .await
            .unwrap();
        assert_eq!(rebuilt.len(Split::Train), 5);
    }

    #[tokio::test]
    async fn test_directory_without_manifest_is_stale() {
        let (dir, store) = make_store();
        let fp = fp(0.5, 3);
        fs::create_dir_all(dir.path().join(fp.name())).unwrap();
        assert!(!store.exists(&fp));
        assert!(matches!(store.get(&fp), Err(CurationError::StaleCache { .. })));
    }

    #[tokio::test]
    async fn test_invalidate_missing_entry() {
        let (_dir, store) = make_store();
        assert!(!store.invalidate(&fp(0.1, 1)).unwrap());
        assert!(store.invalidate_by_name("../escape").is_err());
        assert!(store.invalidate_by_name(".staging").is_err());
    }

    #[tokio::test]
    async fn test_load_roundtrips_records() {
        let (_dir, store) = make_store();
        let fp = fp(0.5, 4);
        let entry = store
            .get_or_create(&fp, serde_json::Value::Null, || async { Ok(records(3, "r")) })
            .await
            .unwrap();
        let train = entry.load(Split::Train).unwrap();
        let ids: Vec<_> = train.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r-0", "r-1", "r-2"]);
        assert!(entry.load(Split::Test).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_valid_and_stale() {
        let (dir, store) = make_store();
        let good = fp(0.5, 5);
        store
            .get_or_create(&good, serde_json::Value::Null, || async { Ok(records(2, "g")) })
            .await
            .unwrap();
        fs::create_dir_all(dir.path().join("half-written")).unwrap();

        let listing = store.list().unwrap();
        assert_eq!(listing.len(), 2);
        assert!(matches!(&listing[0], EntryStatus::Stale { name, .. } if name == "half-written"));
        assert!(matches!(&listing[1], EntryStatus::Valid(e) if e.fingerprint == good));
    }

    #[tokio::test]
    async fn test_build_locks_are_released() {
        let (_dir, store) = make_store();
        for seed in 0..5 {
            store
                .get_or_create(&fp(0.5, seed), serde_json::Value::Null, || async {
                    Ok(records(1, "l"))
                })
                .await
                .unwrap();
        }
        assert_eq!(store.tracked_locks(), 0);

        let failed = store
            .get_or_create(&fp(0.5, 99), serde_json::Value::Null, || async {
                Err(CurationError::invalid("builder", "refused"))
            })
            .await;
        assert!(failed.is_err());

        let stalled_fp = fp(0.5, 100);
        let stalled = store.get_or_create(&stalled_fp, serde_json::Value::Null, || async {
            std::future::pending::<()>().await;
            Ok(records(1, "never"))
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), stalled).await.is_err());
        assert_eq!(store.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_slot_survives_while_shared() {
        let (_dir, store) = make_store();
        let first = store.lock_for("tuab");
        let second = store.lock_for("tuab");
        assert!(Arc::ptr_eq(&first.lock, &second.lock));

        drop(first);
        assert_eq!(store.tracked_locks(), 1);
        drop(second);
        assert_eq!(store.tracked_locks(), 0);
    }
}
