//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a sweep).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_builds: AtomicU64,
    scoring_passes: AtomicU64,
    samples_removed: AtomicU64,
    members_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_builds: AtomicU64::new(0),
            scoring_passes: AtomicU64::new(0),
            samples_removed: AtomicU64::new(0),
            members_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_cache_builds(&self) {
        self.cache_builds.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_builds", "counter incremented");
    }

    /// Add `n` forward passes (samples times passes per sample).
    pub fn add_scoring_passes(&self, n: u64) {
        self.scoring_passes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_samples_removed(&self, n: u64) {
        self.samples_removed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_members_failed(&self) {
        self.members_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "members_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a sweep) rather than on
    /// every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cache_hits = self.cache_hits(),
            cache_builds = self.cache_builds(),
            scoring_passes = self.scoring_passes(),
            samples_removed = self.samples_removed(),
            members_failed = self.members_failed(),
        );
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_builds(&self) -> u64 {
        self.cache_builds.load(Ordering::Relaxed)
    }

    pub fn scoring_passes(&self) -> u64 {
        self.scoring_passes.load(Ordering::Relaxed)
    }

    pub fn samples_removed(&self) -> u64 {
        self.samples_removed.load(Ordering::Relaxed)
    }

    pub fn members_failed(&self) -> u64 {
        self.members_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_builds.store(0, Ordering::Relaxed);
        self.scoring_passes.store(0, Ordering::Relaxed);
        self.samples_removed.store(0, Ordering::Relaxed);
        self.members_failed.store(0, Ordering::Relaxed);
    }
}
