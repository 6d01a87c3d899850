//! Cross-process build leases.
//!
//! A lease is a file created with `create_new` next to the entries. Holding it
//! means holding the right to build one fingerprint. While held, a background
//! task keeps the file's mtime fresh so a long build is never mistaken for an
//! abandoned one. The file carries an owner token and is only removed on drop
//! if the token is still ours, including when the build future is cancelled.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::LockPolicy;
use crate::domain::error::{CurationError, Result};

/// Timing knobs for [`Lease::acquire`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeaseTiming {
    /// A lease whose mtime is older than this is abandoned and may be broken.
    pub stale_after: Duration,
    /// How long a waiting acquirer polls before giving up with `Busy`.
    pub wait: Duration,
    pub poll: Duration,
}

impl LeaseTiming {
    fn heartbeat(&self) -> Duration {
        (self.stale_after / 4).max(Duration::from_millis(10))
    }
}

pub(crate) struct Lease {
    path: PathBuf,
    token: String,
    heartbeat: JoinHandle<()>,
}

impl Lease {
    /// Acquire the lease at `path`.
    ///
    /// With [`LockPolicy::FailFast`] a live lease yields `Busy` immediately;
    /// with [`LockPolicy::Wait`] the call polls until the lease frees up or
    /// `timing.wait` elapses.
    pub(crate) async fn acquire(
        path: &Path,
        fingerprint: &str,
        policy: LockPolicy,
        timing: LeaseTiming,
    ) -> Result<Self> {
        let started = Instant::now();
        let token = Uuid::new_v4().to_string();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let stamp = format!(
                        "token={token} pid={} at={}",
                        std::process::id(),
                        chrono::Utc::now()
                    );
                    if let Err(e) = writeln!(file, "{stamp}") {
                        let _ = fs::remove_file(path);
                        return Err(e.into());
                    }
                    debug!(lease = %path.display(), "lease acquired");
                    let heartbeat = tokio::spawn(refresh(
                        path.to_path_buf(),
                        token.clone(),
                        timing.heartbeat(),
                    ));
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                        heartbeat,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lease_age(path).is_some_and(|age| age > timing.stale_after) {
                        warn!(lease = %path.display(), "breaking abandoned lease");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if policy == LockPolicy::FailFast || started.elapsed() > timing.wait {
                        return Err(CurationError::Busy {
                            fingerprint: fingerprint.to_string(),
                        });
                    }
                    tokio::time::sleep(timing.poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if !owned_by(&self.path, &self.token) {
            warn!(lease = %self.path.display(), "lease was taken over; leaving it in place");
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lease = %self.path.display(), error = %e, "failed to release lease");
        }
    }
}

/// Bump the lease mtime every `every` until it stops being ours.
async fn refresh(path: PathBuf, token: String, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !owned_by(&path, &token) {
            warn!(lease = %path.display(), "lease lost while building");
            return;
        }
        let touched = OpenOptions::new()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            warn!(lease = %path.display(), error = %e, "failed to refresh lease");
        }
    }
}

fn owned_by(path: &Path, token: &str) -> bool {
    let expected = format!("token={token}");
    fs::read_to_string(path)
        .map(|content| content.split_whitespace().any(|word| word == expected))
        .unwrap_or(false)
}

fn lease_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
