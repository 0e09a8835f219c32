//! Pipeline facade: the surface the surrounding application calls.
//!
//! Submission and edits are synchronous with respect to moderation and
//! return a definite outcome. Reply scheduling is fire-and-forget: a
//! failure to schedule is logged and never reaches the submitting caller.

use std::sync::Arc;
use std::time::Duration;

use postgate_state::{
    AuthorId, ContentStore, IdentityProvider, JobId, JobStore, NewUnit, ReplyJob, TextUnit, UnitId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PostgateError, Result};
use crate::gateway::{Classifier, Generator};
use crate::moderation::{ModerationGate, ModerationOutcome};
use crate::reply::{Dispatcher, ReplyExecutor, ReplyScheduler};

/// A new post or comment as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub parent_id: Option<UnitId>,
    pub title: Option<String>,
    pub raw_text: String,
}

impl Draft {
    pub fn post(title: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            parent_id: None,
            title: Some(title.into()),
            raw_text: raw_text.into(),
        }
    }

    pub fn comment(parent_id: UnitId, raw_text: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id),
            title: None,
            raw_text: raw_text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub unit_id: UnitId,
    pub outcome: ModerationOutcome,
    /// Set when the submission scheduled an auto-reply.
    pub reply_job: Option<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditReceipt {
    pub unit_id: UnitId,
    pub outcome: ModerationOutcome,
    /// Whether the edit cancelled a pending auto-reply.
    pub cancelled_reply: bool,
}

/// Wires the gate, scheduler and executor over one set of collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    content: Arc<dyn ContentStore>,
    identity: Arc<dyn IdentityProvider>,
    gate: ModerationGate,
    scheduler: ReplyScheduler,
    executor: ReplyExecutor,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        content: Arc<dyn ContentStore>,
        identity: Arc<dyn IdentityProvider>,
        jobs: Arc<dyn JobStore>,
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        config.validate()?;

        let gate = ModerationGate::new(
            classifier,
            config.moderation.clone(),
            config.gateways.clone(),
        );
        let scheduler = ReplyScheduler::new(jobs);
        let executor = ReplyExecutor::new(
            Arc::clone(&content),
            generator,
            gate.clone(),
            scheduler.clone(),
            config.replies.clone(),
            config.gateways.clone(),
        );

        Ok(Self {
            config,
            content,
            identity,
            gate,
            scheduler,
            executor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gate(&self) -> &ModerationGate {
        &self.gate
    }

    pub fn scheduler(&self) -> &ReplyScheduler {
        &self.scheduler
    }

    pub fn executor(&self) -> &ReplyExecutor {
        &self.executor
    }

    /// A dispatcher draining this pipeline's jobs.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.scheduler.clone(),
            self.executor.clone(),
            self.config.dispatch.clone(),
        )
    }

    async fn authenticate(&self, token: &str) -> Result<AuthorId> {
        self.identity
            .authenticate(token)
            .await?
            .ok_or(PostgateError::Unauthenticated)
    }

    /// Create a unit, moderate it, persist the outcome and, for an allowed
    /// comment on a post with auto-reply enabled, schedule a reply.
    #[instrument(skip(self, token, draft), fields(parent_id = ?draft.parent_id))]
    pub async fn submit_text(&self, token: &str, draft: Draft) -> Result<SubmitReceipt> {
        let author_id = self.authenticate(token).await?;
        if draft.raw_text.trim().is_empty() {
            return Err(PostgateError::InvalidRequest("text must not be empty".to_string()));
        }

        let unit = self
            .content
            .create_unit(NewUnit {
                author_id,
                parent_id: draft.parent_id,
                title: draft.title,
                raw_text: draft.raw_text,
                is_auto_reply: false,
            })
            .await?;

        let decision = self.gate.evaluate_unit(&unit.id, &unit.raw_text).await;
        self.content
            .update_unit_state(&unit.id, decision.outcome.into(), decision.stored_text)
            .await?;

        let reply_job = if decision.outcome == ModerationOutcome::Allowed && !unit.is_post() {
            self.schedule_for(&unit).await
        } else {
            None
        };

        Ok(SubmitReceipt {
            unit_id: unit.id,
            outcome: decision.outcome,
            reply_job,
        })
    }

    /// Replace a unit's text and run it through the gate again.
    ///
    /// Only the author may edit. A comment edited into BLOCKED loses its
    /// still-SCHEDULED reply.
    #[instrument(skip(self, token, raw_text), fields(unit_id = %unit_id))]
    pub async fn edit_text(
        &self,
        token: &str,
        unit_id: &UnitId,
        raw_text: String,
    ) -> Result<EditReceipt> {
        let author_id = self.authenticate(token).await?;
        let existing = self.content.get_unit(unit_id).await?;
        if existing.author_id != author_id {
            return Err(PostgateError::Forbidden {
                author_id: author_id.to_string(),
                unit_id: unit_id.to_string(),
            });
        }
        if raw_text.trim().is_empty() {
            return Err(PostgateError::InvalidRequest("text must not be empty".to_string()));
        }

        let revised = self.content.revise_unit(unit_id, raw_text).await?;
        let decision = self.gate.evaluate_unit(unit_id, &revised.raw_text).await;
        let blocked = decision.is_blocked();
        let outcome = decision.outcome;
        self.content
            .update_unit_state(unit_id, outcome.into(), decision.stored_text)
            .await?;

        let cancelled_reply = if blocked && !revised.is_post() {
            match self.scheduler.cancel(unit_id).await {
                Ok(cancelled) => cancelled,
                Err(e) => {
                    warn!(error = %e, "could not cancel reply for blocked edit");
                    false
                }
            }
        } else {
            false
        };

        Ok(EditReceipt {
            unit_id: unit_id.clone(),
            outcome,
            cancelled_reply,
        })
    }

    pub async fn schedule_reply(
        &self,
        comment_id: &UnitId,
        post_id: &UnitId,
        delay: Duration,
    ) -> Result<ReplyJob> {
        self.scheduler.enqueue(comment_id, post_id, delay).await
    }

    pub async fn cancel_reply(&self, comment_id: &UnitId) -> Result<bool> {
        self.scheduler.cancel(comment_id).await
    }

    pub async fn replay_failed(&self, job_id: &JobId) -> Result<ReplyJob> {
        self.scheduler.replay(job_id).await
    }

    /// Schedule a reply for a freshly allowed comment, if its post wants one.
    /// Failures are logged and swallowed.
    async fn schedule_for(&self, comment: &TextUnit) -> Option<JobId> {
        let post_id = comment.parent_id.as_ref()?;
        match self.try_schedule(comment, post_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(comment_id = %comment.id, error = %e, "auto-reply not scheduled");
                None
            }
        }
    }

    async fn try_schedule(&self, comment: &TextUnit, post_id: &UnitId) -> Result<Option<JobId>> {
        if !self.config.gateways.generator_enabled {
            return Ok(None);
        }
        let post = self.content.get_unit(post_id).await?;
        if !post.is_post() {
            debug!(comment_id = %comment.id, "nested comment; no auto-reply");
            return Ok(None);
        }
        let policy = self.content.get_post_policy(post_id).await?;
        if !policy.enabled {
            return Ok(None);
        }

        let delay_secs = policy
            .delay_seconds
            .unwrap_or(self.config.replies.default_delay_seconds);
        let job = self
            .scheduler
            .enqueue(&comment.id, post_id, Duration::from_secs(delay_secs))
            .await?;
        Ok(Some(job.job_id))
    }
}
