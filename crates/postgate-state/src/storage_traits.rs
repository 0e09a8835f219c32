//! Storage trait definitions for postgate
//!
//! These traits define the collaborators the moderation pipeline consumes:
//! - `ContentStore`: posts and comments keyed by opaque unit IDs
//! - `IdentityProvider`: resolves a caller credential to a stable author ID
//! - `JobStore`: the reply job table, the only contended resource
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier of a text unit (post or comment)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub String);

impl UnitId {
    /// Generate a new random UnitId
    pub fn new() -> Self {
        UnitId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        UnitId(s.to_string())
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable author identity yielded by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorId(pub String);

impl AuthorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AuthorId {
    fn from(s: &str) -> Self {
        AuthorId(s.to_string())
    }
}

impl std::fmt::Display for AuthorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a reply job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ContentStore: posts and comments
// ---------------------------------------------------------------------------

/// Moderation state of a text unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationState {
    Pending,
    Allowed,
    Blocked,
}

/// A post (no parent) or comment (parent is the post) subject to moderation.
///
/// Readers only ever see `stored_text`, and only once the state has left
/// `Pending`. A `Blocked` unit carries the moderation placeholder in
/// `stored_text`; `raw_text` is kept for operators and never shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub id: UnitId,
    pub author_id: AuthorId,
    pub parent_id: Option<UnitId>,
    /// Posts carry a title; comments don't.
    pub title: Option<String>,
    pub raw_text: String,
    pub stored_text: String,
    pub moderation_state: ModerationState,
    /// Set on units produced by the reply pipeline.
    pub is_auto_reply: bool,
    pub created_at: DateTime<Utc>,
}

impl TextUnit {
    pub fn is_post(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_visible(&self) -> bool {
        self.moderation_state != ModerationState::Pending
    }

    /// The text a reader is allowed to see, if any.
    pub fn visible_text(&self) -> Option<&str> {
        if self.is_visible() {
            Some(&self.stored_text)
        } else {
            None
        }
    }
}

/// Input for `ContentStore::create_unit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUnit {
    pub author_id: AuthorId,
    pub parent_id: Option<UnitId>,
    pub title: Option<String>,
    pub raw_text: String,
    pub is_auto_reply: bool,
}

impl NewUnit {
    /// A top-level post.
    pub fn post(author_id: AuthorId, title: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            author_id,
            parent_id: None,
            title: Some(title.into()),
            raw_text: raw_text.into(),
            is_auto_reply: false,
        }
    }

    /// A comment under `parent_id`.
    pub fn comment(author_id: AuthorId, parent_id: UnitId, raw_text: impl Into<String>) -> Self {
        Self {
            author_id,
            parent_id: Some(parent_id),
            title: None,
            raw_text: raw_text.into(),
            is_auto_reply: false,
        }
    }
}

/// Per-post auto-reply settings, read once when a comment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AutoReplyPolicy {
    pub enabled: bool,
    /// `None` falls back to the configured default delay.
    pub delay_seconds: Option<u64>,
}

impl AutoReplyPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled_after(delay_seconds: u64) -> Self {
        Self {
            enabled: true,
            delay_seconds: Some(delay_seconds),
        }
    }
}

/// Content store consumed by the pipeline.
///
/// Guarantees:
/// - `create_unit` returns a unit in `Pending` state with empty `stored_text`.
/// - Lookups of deleted or unknown units fail with `StorageError::UnitNotFound`.
/// - Concurrent reads and writes keyed by unit ID are safe.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Retrieve a unit by ID.
    async fn get_unit(&self, id: &UnitId) -> StorageResult<TextUnit>;

    /// Create a new unit in `Pending` state.
    async fn create_unit(&self, unit: NewUnit) -> StorageResult<TextUnit>;

    /// Record the moderation outcome and the text readers will see.
    async fn update_unit_state(
        &self,
        id: &UnitId,
        state: ModerationState,
        stored_text: String,
    ) -> StorageResult<()>;

    /// Replace the raw text of an edited unit and reset it to `Pending`.
    async fn revise_unit(&self, id: &UnitId, raw_text: String) -> StorageResult<TextUnit>;

    /// Auto-reply policy of a post. Fails with `UnitNotFound` if the post is gone.
    async fn get_post_policy(&self, post_id: &UnitId) -> StorageResult<AutoReplyPolicy>;

    /// Direct children of a unit, oldest first.
    async fn list_children(&self, parent_id: &UnitId) -> StorageResult<Vec<TextUnit>>;
}

// ---------------------------------------------------------------------------
// IdentityProvider
// ---------------------------------------------------------------------------

/// Authenticates a caller credential.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a credential to an author. `None` means the credential is unknown.
    async fn authenticate(&self, token: &str) -> StorageResult<Option<AuthorId>>;
}

// ---------------------------------------------------------------------------
// JobStore: reply job table
// ---------------------------------------------------------------------------

/// Lifecycle of a reply job.
///
/// `Scheduled -> Running -> Done | Failed`, with `Scheduled -> Cancelled` as
/// the only other exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Cancelled,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Done | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(StorageError::Backend(format!("unknown job status: {other}"))),
        }
    }
}

/// A pending (or finished) auto-generated reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyJob {
    pub job_id: JobId,
    pub comment_id: UnitId,
    pub post_id: UnitId,
    pub not_before: DateTime<Utc>,
    pub status: JobStatus,
    /// Generator attempts made by the executor.
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// The reply unit created by a `Done` job, if any.
    pub reply_id: Option<UnitId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReplyJob {
    /// A fresh job in `Scheduled` state.
    pub fn scheduled(comment_id: UnitId, post_id: UnitId, not_before: DateTime<Utc>) -> Self {
        Self {
            job_id: JobId::new(),
            comment_id,
            post_id,
            not_before,
            status: JobStatus::Scheduled,
            attempts: 0,
            failure_reason: None,
            reply_id: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Scheduled && self.not_before <= now
    }
}

/// Terminal outcome recorded for a `Running` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobResolution {
    /// Finished; `reply_id` is `None` when the job was cancelled by context.
    Done { reply_id: Option<UnitId> },
    Failed { reason: String },
}

impl JobResolution {
    pub fn status(&self) -> JobStatus {
        match self {
            JobResolution::Done { .. } => JobStatus::Done,
            JobResolution::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Reply job table.
///
/// Guarantees:
/// - At most one non-terminal job exists per `comment_id`; `insert` fails
///   with `StorageError::DuplicateJob` otherwise.
/// - `compare_and_set` is atomic with respect to the job's current status:
///   of several concurrent callers expecting the same status, at most one
///   observes `true`.
/// - Terminal jobs are immutable.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `Scheduled` job.
    async fn insert(&self, job: ReplyJob) -> StorageResult<()>;

    /// Retrieve a job by ID.
    async fn get(&self, job_id: &JobId) -> StorageResult<ReplyJob>;

    /// The non-terminal job for a comment, if any.
    async fn active_for_comment(&self, comment_id: &UnitId) -> StorageResult<Option<ReplyJob>>;

    /// Every job ever recorded for a comment, oldest first.
    async fn jobs_for_comment(&self, comment_id: &UnitId) -> StorageResult<Vec<ReplyJob>>;

    /// Move a job from `expected` to `next` if and only if it is currently
    /// in `expected`. Returns whether the transition happened.
    async fn compare_and_set(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> StorageResult<bool>;

    /// Finish a `Running` job. Fails with `InvalidJobState` for any other status.
    async fn resolve(
        &self,
        job_id: &JobId,
        resolution: JobResolution,
        attempts: u32,
    ) -> StorageResult<()>;

    /// `Scheduled` jobs with `not_before <= now`, earliest first, at most `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ReplyJob>>;

    /// Earliest `not_before` among `Scheduled` jobs.
    async fn next_due(&self) -> StorageResult<Option<DateTime<Utc>>>;

    /// All jobs, optionally filtered by status, oldest first.
    async fn list(&self, status: Option<JobStatus>) -> StorageResult<Vec<ReplyJob>>;
}
