//! Structured observability hooks for the moderation and reply lifecycle.
//!
//! This module provides:
//! - Job-scoped tracing spans via the `JobSpan` RAII guard
//! - Emission functions for gate decisions and reply job transitions
//!
//! Raw text never reaches the log; [`text_digest`] identifies it instead.

use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// RAII guard that enters a job-scoped span for the duration of an execution.
///
/// # Example
///
/// ```ignore
/// let _span = JobSpan::enter("0b6f...");
/// // tracing calls in this scope carry job_id
/// ```
pub struct JobSpan {
    _span: tracing::span::EnteredSpan,
}

impl JobSpan {
    pub fn enter(job_id: &str) -> Self {
        let span = tracing::info_span!("postgate.job", job_id = %job_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// First 12 hex chars of the SHA-256 of `text`.
pub fn text_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(12);
    hex
}

/// Emit event: the moderation gate reached a decision.
pub fn emit_gate_evaluated(
    unit_id: Option<&str>,
    text: &str,
    outcome: &str,
    source: &str,
    latency_ms: u64,
) {
    info!(
        event = "gate.evaluated",
        unit_id = unit_id.unwrap_or("-"),
        text_digest = %text_digest(text),
        outcome = outcome,
        source = source,
        latency_ms = latency_ms,
    );
}

/// Emit event: a reply job was scheduled.
pub fn emit_job_scheduled(job_id: &str, comment_id: &str, delay_secs: u64) {
    info!(
        event = "job.scheduled",
        job_id = %job_id,
        comment_id = %comment_id,
        delay_secs = delay_secs,
    );
}

/// Emit event: a scheduled job was cancelled before it ran.
pub fn emit_job_cancelled(job_id: &str, comment_id: &str) {
    info!(event = "job.cancelled", job_id = %job_id, comment_id = %comment_id);
}

/// Emit event: a dispatcher won the SCHEDULED -> RUNNING transition.
pub fn emit_job_claimed(job_id: &str, comment_id: &str) {
    info!(event = "job.claimed", job_id = %job_id, comment_id = %comment_id);
}

/// Emit event: a job reached a terminal state.
pub fn emit_job_finished(job_id: &str, status: &str, attempts: u32, reason: Option<&str>) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        status = status,
        attempts = attempts,
        reason = reason.unwrap_or("-"),
    );
}

pub fn emit_job_recovered(job_id: &str, status: &str) {
    warn!(event = "job.recovered", job_id = %job_id, status = status);
}

/// Emit event: a generated reply was persisted.
pub fn emit_reply_created(job_id: &str, reply_id: &str, outcome: &str) {
    info!(
        event = "reply.created",
        job_id = %job_id,
        reply_id = %reply_id,
        outcome = outcome,
    );
}

/// Emit event: a retryable upstream failure, with the sleep before the next attempt.
pub fn emit_upstream_retry(gateway: &str, attempt: u32, backoff_ms: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "upstream.retry",
        gateway = gateway,
        attempt = attempt,
        backoff_ms = backoff_ms,
        error = %error,
    );
}
