//! Reply execution: turn one claimed job into at most one reply unit.

use std::sync::Arc;

use postgate_state::{
    AuthorId, ContentStore, ModerationState, NewUnit, ReplyJob, StorageError, TextUnit, UnitId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::{GatewayConfig, ReplyConfig};
use crate::error::Result;
use crate::gateway::{bounded, GatewayError, Generator, ReplyContext, GENERATOR};
use crate::moderation::{ModerationGate, ModerationOutcome};
use crate::obs;

use super::scheduler::ReplyScheduler;

/// Why a job finished DONE without producing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CommentGone,
    PostGone,
    CommentNotAllowed,
    PolicyDisabled,
    GeneratorDisabled,
    AlreadyReplied,
}

/// Result of [`ReplyExecutor::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    /// A reply unit was created; `outcome` is the gate's decision on it.
    Replied {
        reply_id: UnitId,
        outcome: ModerationOutcome,
        attempts: u32,
    },
    /// DONE with no output.
    Skipped(SkipReason),
    /// FAILED; the job carries the same reason.
    Failed { reason: String, attempts: u32 },
}

impl ExecutionOutcome {
    pub fn reply_id(&self) -> Option<&UnitId> {
        match self {
            ExecutionOutcome::Replied { reply_id, .. } => Some(reply_id),
            _ => None,
        }
    }
}

/// Trim, drop surrounding quotes, and cap at `max_chars` characters
/// (the last three being `...` when cut).
pub fn clean_reply(text: &str, max_chars: usize) -> String {
    let cleaned = text
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim();

    if cleaned.chars().count() <= max_chars {
        return cleaned.to_string();
    }
    let mut cut: String = cleaned.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// Preconditions that held at execution time.
struct Context {
    post: TextUnit,
    comment: TextUnit,
}

/// Runs claimed (RUNNING) jobs to a terminal state.
#[derive(Clone)]
pub struct ReplyExecutor {
    content: Arc<dyn ContentStore>,
    generator: Arc<dyn Generator>,
    gate: ModerationGate,
    scheduler: ReplyScheduler,
    replies: ReplyConfig,
    gateways: GatewayConfig,
}

impl ReplyExecutor {
    pub fn new(
        content: Arc<dyn ContentStore>,
        generator: Arc<dyn Generator>,
        gate: ModerationGate,
        scheduler: ReplyScheduler,
        replies: ReplyConfig,
        gateways: GatewayConfig,
    ) -> Self {
        Self {
            content,
            generator,
            gate,
            scheduler,
            replies,
            gateways,
        }
    }

    /// Execute one RUNNING job and record its terminal state.
    ///
    /// Errors are returned only when the terminal state itself could not be
    /// recorded; every other failure ends the job FAILED.
    #[instrument(skip(self, job), fields(job_id = %job.job_id, comment_id = %job.comment_id))]
    pub async fn run(&self, job: ReplyJob) -> Result<ExecutionOutcome> {
        let ctx = match self.load_context(&job).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(skip)) => {
                debug!(reason = ?skip, "reply skipped");
                self.scheduler.complete(&job.job_id, None, 0).await?;
                return Ok(ExecutionOutcome::Skipped(skip));
            }
            Err(err) => {
                return self
                    .give_up(&job, format!("content store: {err}"), 0)
                    .await;
            }
        };

        let request = ReplyContext {
            post_title: ctx.post.title.clone().unwrap_or_default(),
            post_content: ctx.post.stored_text.clone(),
            comment_text: ctx.comment.stored_text.clone(),
        };

        let (generated, attempts) = match self.generate_with_retry(&request).await {
            Ok(done) => done,
            Err((err, attempts)) => return self.give_up(&job, err.to_string(), attempts).await,
        };

        // Generated text goes through the same gate as user text.
        let decision = self.gate.evaluate(&generated).await;

        let reply_id = match self
            .persist(&job, &generated, &decision.stored_text, decision.outcome)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                // The generator already answered; retrying could post twice.
                return self
                    .give_up(&job, format!("persisting reply failed: {err}"), attempts)
                    .await;
            }
        };

        obs::emit_reply_created(
            job.job_id.as_str(),
            reply_id.as_str(),
            decision.outcome.as_str(),
        );
        self.scheduler
            .complete(&job.job_id, Some(reply_id.clone()), attempts)
            .await?;

        Ok(ExecutionOutcome::Replied {
            reply_id,
            outcome: decision.outcome,
            attempts,
        })
    }

    /// Re-check everything that may have changed since scheduling.
    async fn load_context(
        &self,
        job: &ReplyJob,
    ) -> std::result::Result<std::result::Result<Context, SkipReason>, StorageError> {
        let comment = match self.content.get_unit(&job.comment_id).await {
            Ok(unit) => unit,
            Err(e) if e.is_not_found() => return Ok(Err(SkipReason::CommentGone)),
            Err(e) => return Err(e),
        };
        let post = match self.content.get_unit(&job.post_id).await {
            Ok(unit) => unit,
            Err(e) if e.is_not_found() => return Ok(Err(SkipReason::PostGone)),
            Err(e) => return Err(e),
        };
        if comment.moderation_state != ModerationState::Allowed {
            return Ok(Err(SkipReason::CommentNotAllowed));
        }

        let policy = match self.content.get_post_policy(&job.post_id).await {
            Ok(policy) => policy,
            Err(e) if e.is_not_found() => return Ok(Err(SkipReason::PostGone)),
            Err(e) => return Err(e),
        };
        if !policy.enabled {
            return Ok(Err(SkipReason::PolicyDisabled));
        }
        if !self.gateways.generator_enabled {
            return Ok(Err(SkipReason::GeneratorDisabled));
        }

        let children = self.content.list_children(&job.comment_id).await?;
        // A PENDING auto-reply is an orphan of a failed persist, never shown.
        if children
            .iter()
            .any(|c| c.is_auto_reply && c.moderation_state != ModerationState::Pending)
        {
            return Ok(Err(SkipReason::AlreadyReplied));
        }

        Ok(Ok(Context { post, comment }))
    }

    /// Call the generator, retrying only `UpstreamUnavailable`.
    ///
    /// Returns the cleaned text and the number of attempts made.
    async fn generate_with_retry(
        &self,
        request: &ReplyContext,
    ) -> std::result::Result<(String, u32), (GatewayError, u32)> {
        let max_attempts = self.replies.max_attempts.max(1);
        let timeout = self.gateways.request_timeout();

        let mut attempt = 1;
        loop {
            let result = bounded(GENERATOR, timeout, self.generator.generate(request))
                .await
                .and_then(|raw| {
                    let cleaned = clean_reply(&raw, self.replies.max_reply_chars);
                    if cleaned.is_empty() {
                        Err(GatewayError::rejected(GENERATOR, "empty reply"))
                    } else {
                        Ok(cleaned)
                    }
                });

            match result {
                Ok(text) => return Ok((text, attempt)),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.replies.backoff_after(attempt);
                    obs::emit_upstream_retry(GENERATOR, attempt, backoff.as_millis() as u64, &err);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }

    async fn persist(
        &self,
        job: &ReplyJob,
        generated: &str,
        stored_text: &str,
        outcome: ModerationOutcome,
    ) -> std::result::Result<UnitId, StorageError> {
        let marker = &self.replies.marker;
        let unit = self
            .content
            .create_unit(NewUnit {
                author_id: AuthorId(self.replies.system_author_id.clone()),
                parent_id: Some(job.comment_id.clone()),
                title: None,
                raw_text: format!("{marker} {generated}"),
                is_auto_reply: true,
            })
            .await?;
        self.content
            .update_unit_state(&unit.id, outcome.into(), format!("{marker} {stored_text}"))
            .await?;
        Ok(unit.id)
    }

    async fn give_up(
        &self,
        job: &ReplyJob,
        reason: String,
        attempts: u32,
    ) -> Result<ExecutionOutcome> {
        warn!(reason = %reason, attempts, "reply job failed");
        self.scheduler.fail(&job.job_id, &reason, attempts).await?;
        Ok(ExecutionOutcome::Failed { reason, attempts })
    }
}
