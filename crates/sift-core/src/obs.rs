//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - Member-scoped tracing spans via `MemberSpan` RAII guard
//! - Emission functions for cache, stage and sweep events
//!
//! Events are emitted at `info!` level (configurable via `RUST_LOG`).
//! For JSON output, pass `--log-json` or set `logging.json = true`.

use tracing::{info, warn};

/// RAII guard that enters a sweep-member span for the duration of a pipeline run.
///
/// # Example
///
/// ```ignore
/// let _span = MemberSpan::enter("m003", "tuab_dropout_0.5_seed_12");
/// // every event below carries member = "m003"
/// ```
pub struct MemberSpan {
    _span: tracing::span::EnteredSpan,
}

impl MemberSpan {
    pub fn enter(member: &str, fingerprint: &str) -> Self {
        let span = tracing::info_span!("sift.member", member = %member, fingerprint = %fingerprint);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_cache_hit(fingerprint: &str) {
    info!(event = "cache.hit", fingerprint = %fingerprint);
}

/// Emit event: a cache entry was built and published.
pub fn emit_cache_built(fingerprint: &str, records: usize, duration_ms: u64) {
    info!(
        event = "cache.built",
        fingerprint = %fingerprint,
        records = records,
        duration_ms = duration_ms,
    );
}

pub fn emit_cache_invalidated(fingerprint: &str) {
    info!(event = "cache.invalidated", fingerprint = %fingerprint);
}

/// Emit event: pipeline entered a state.
pub fn emit_stage_entered(fingerprint: &str, state: &str) {
    info!(event = "stage.entered", fingerprint = %fingerprint, state = %state);
}

/// Emit event: state work finished, with wall time.
pub fn emit_stage_completed(fingerprint: &str, state: &str, duration_ms: u64) {
    info!(
        event = "stage.completed",
        fingerprint = %fingerprint,
        state = %state,
        duration_ms = duration_ms,
    );
}

/// Emit event: a sweep member failed (warning level).
pub fn emit_member_failed(member: &str, kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "member.failed", member = %member, kind = %kind, error = %error);
}

/// Emit event: sweep finished.
pub fn emit_sweep_finished(total: usize, failed: usize, duration_ms: u64) {
    info!(
        event = "sweep.finished",
        total = total,
        failed = failed,
        duration_ms = duration_ms,
    );
}
