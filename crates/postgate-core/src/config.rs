//! Pipeline configuration.
//!
//! Every component receives its slice of [`PipelineConfig`] at construction;
//! nothing reads process-global settings, so differently configured
//! pipelines can run side by side.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PostgateError, Result};

/// How the moderation gate treats an unreachable or failing classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Treat the text as BLOCKED.
    #[default]
    FailClosed,
    /// Let the text through as ALLOWED.
    FailOpen,
}

impl std::str::FromStr for FailurePolicy {
    type Err = PostgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            other => Err(PostgateError::InvalidConfig(format!(
                "unknown failure policy: {other}"
            ))),
        }
    }
}

/// Gateway switches and the hard per-request timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub classifier_enabled: bool,
    pub generator_enabled: bool,
    /// Hard timeout for a single classify/generate call (milliseconds).
    pub request_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            classifier_enabled: true,
            generator_enabled: true,
            request_timeout_ms: 5_000,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Moderation gate settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationConfig {
    /// A flagged verdict at or above this confidence blocks the text.
    pub confidence_threshold: f32,
    pub failure_policy: FailurePolicy,
    /// Stored in place of blocked text.
    pub blocked_placeholder: String,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            failure_policy: FailurePolicy::FailClosed,
            blocked_placeholder: "[This content has been blocked by moderation]".to_string(),
        }
    }
}

/// Reply generation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyConfig {
    /// Delay used when a post's policy doesn't name one.
    pub default_delay_seconds: u64,
    /// Total generator attempts per job (1 = no retries).
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff sleep (milliseconds).
    pub max_backoff_ms: u64,
    /// Prefixed to every generated reply.
    pub marker: String,
    /// Author of generated replies.
    pub system_author_id: String,
    /// Generated text longer than this is truncated.
    pub max_reply_chars: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            default_delay_seconds: 60,
            max_attempts: 3,
            backoff_base_ms: 500,
            max_backoff_ms: 30_000,
            marker: "[Auto-reply]".to_string(),
            system_author_id: "system:auto-reply".to_string(),
            max_reply_chars: 500,
        }
    }
}

impl ReplyConfig {
    /// Sleep before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Worker pool settings for the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Maximum concurrently running reply executions.
    pub worker_count: usize,
    /// Maximum jobs claimed per scan.
    pub batch_size: usize,
    /// Upper bound on the sleep between scans (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 64,
            poll_interval_ms: 1_000,
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Connection settings for the HTTP classifier/generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL of the model API, e.g. `https://generativelanguage.googleapis.com/v1beta`.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub classifier_model: String,
    pub generator_model: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: None,
            classifier_model: "gemini-pro".to_string(),
            generator_model: "gemini-pro".to_string(),
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub gateways: GatewayConfig,
    pub moderation: ModerationConfig,
    pub replies: ReplyConfig,
    pub dispatch: DispatchConfig,
    pub upstream: UpstreamConfig,
}

impl PipelineConfig {
    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.moderation.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PostgateError::InvalidConfig(format!(
                "confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.gateways.request_timeout_ms == 0 {
            return Err(PostgateError::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.replies.max_attempts == 0 {
            return Err(PostgateError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.replies.max_reply_chars < 4 {
            return Err(PostgateError::InvalidConfig(
                "max_reply_chars must be at least 4".to_string(),
            ));
        }
        if self.dispatch.worker_count == 0 || self.dispatch.batch_size == 0 {
            return Err(PostgateError::InvalidConfig(
                "worker_count and batch_size must be at least 1".to_string(),
            ));
        }
        if self.replies.system_author_id.trim().is_empty() {
            return Err(PostgateError::InvalidConfig(
                "system_author_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.moderation.failure_policy = policy;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.moderation.confidence_threshold = threshold;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.replies.max_attempts = attempts;
        self
    }
}
