//! In-memory fakes for storage traits
//!
//! Provides `MemoryContentStore`, `StaticIdentityProvider` and
//! `MemoryJobStore`, which satisfy the trait contracts without any external
//! dependencies. `MemoryJobStore` doubles as the in-process reference job
//! table for deployments that don't need durability.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryContentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ContentState {
    units: HashMap<UnitId, TextUnit>,
    policies: HashMap<UnitId, AutoReplyPolicy>,
}

/// In-memory content store backed by a `HashMap<UnitId, TextUnit>`.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    state: Mutex<ContentState>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach (or replace) the auto-reply policy of a post.
    pub fn set_post_policy(&self, post_id: &UnitId, policy: AutoReplyPolicy) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        if !state.units.contains_key(post_id) {
            return Err(StorageError::UnitNotFound {
                unit_id: post_id.to_string(),
            });
        }
        state.policies.insert(post_id.clone(), policy);
        Ok(())
    }

    /// Remove a unit. No-op if absent.
    pub fn delete_unit(&self, id: &UnitId) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        state.units.remove(id);
        state.policies.remove(id);
        Ok(())
    }

    /// Snapshot of every stored unit, oldest first.
    pub fn units(&self) -> StorageResult<Vec<TextUnit>> {
        let state = lock(&self.state)?;
        let mut units: Vec<TextUnit> = state.units.values().cloned().collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_unit(&self, id: &UnitId) -> StorageResult<TextUnit> {
        let state = lock(&self.state)?;
        state
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::UnitNotFound {
                unit_id: id.to_string(),
            })
    }

    async fn create_unit(&self, unit: NewUnit) -> StorageResult<TextUnit> {
        let mut state = lock(&self.state)?;
        if let Some(parent) = &unit.parent_id {
            if !state.units.contains_key(parent) {
                return Err(StorageError::UnitNotFound {
                    unit_id: parent.to_string(),
                });
            }
        }
        let record = TextUnit {
            id: UnitId::new(),
            author_id: unit.author_id,
            parent_id: unit.parent_id,
            title: unit.title,
            raw_text: unit.raw_text,
            stored_text: String::new(),
            moderation_state: ModerationState::Pending,
            is_auto_reply: unit.is_auto_reply,
            created_at: Utc::now(),
        };
        state.units.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_unit_state(
        &self,
        id: &UnitId,
        moderation_state: ModerationState,
        stored_text: String,
    ) -> StorageResult<()> {
        let mut state = lock(&self.state)?;
        let unit = state
            .units
            .get_mut(id)
            .ok_or_else(|| StorageError::UnitNotFound {
                unit_id: id.to_string(),
            })?;
        unit.moderation_state = moderation_state;
        unit.stored_text = stored_text;
        Ok(())
    }

    async fn revise_unit(&self, id: &UnitId, raw_text: String) -> StorageResult<TextUnit> {
        let mut state = lock(&self.state)?;
        let unit = state
            .units
            .get_mut(id)
            .ok_or_else(|| StorageError::UnitNotFound {
                unit_id: id.to_string(),
            })?;
        unit.raw_text = raw_text;
        unit.stored_text = String::new();
        unit.moderation_state = ModerationState::Pending;
        Ok(unit.clone())
    }

    async fn get_post_policy(&self, post_id: &UnitId) -> StorageResult<AutoReplyPolicy> {
        let state = lock(&self.state)?;
        if !state.units.contains_key(post_id) {
            return Err(StorageError::UnitNotFound {
                unit_id: post_id.to_string(),
            });
        }
        Ok(state.policies.get(post_id).copied().unwrap_or_default())
    }

    async fn list_children(&self, parent_id: &UnitId) -> StorageResult<Vec<TextUnit>> {
        let state = lock(&self.state)?;
        let mut children: Vec<TextUnit> = state
            .units
            .values()
            .filter(|u| u.parent_id.as_ref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|u| u.created_at);
        Ok(children)
    }
}

// ---------------------------------------------------------------------------
// StaticIdentityProvider
// ---------------------------------------------------------------------------

/// Identity provider backed by a fixed token-to-author map.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, AuthorId>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token (builder pattern).
    pub fn with_token(mut self, token: &str, author: &str) -> Self {
        self.tokens.insert(token.to_string(), AuthorId::from(author));
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, token: &str) -> StorageResult<Option<AuthorId>> {
        Ok(self.tokens.get(token).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

/// In-memory job table backed by a `HashMap<JobId, ReplyJob>`.
///
/// A single mutex guards the whole table, so the duplicate check in
/// `insert` and the status check in `compare_and_set` are atomic.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, ReplyJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_creation(mut jobs: Vec<ReplyJob>) -> Vec<ReplyJob> {
    jobs.sort_by_key(|j| j.created_at);
    jobs
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: ReplyJob) -> StorageResult<()> {
        let mut jobs = lock(&self.jobs)?;
        if job.status != JobStatus::Scheduled {
            return Err(StorageError::InvalidJobState {
                job_id: job.job_id.to_string(),
                status: job.status.to_string(),
                expected: JobStatus::Scheduled.to_string(),
            });
        }
        let duplicate = jobs
            .values()
            .any(|j| j.comment_id == job.comment_id && !j.status.is_terminal());
        if duplicate {
            return Err(StorageError::DuplicateJob {
                comment_id: job.comment_id.to_string(),
            });
        }
        jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<ReplyJob> {
        let jobs = lock(&self.jobs)?;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    async fn active_for_comment(&self, comment_id: &UnitId) -> StorageResult<Option<ReplyJob>> {
        let jobs = lock(&self.jobs)?;
        Ok(jobs
            .values()
            .find(|j| &j.comment_id == comment_id && !j.status.is_terminal())
            .cloned())
    }

    async fn jobs_for_comment(&self, comment_id: &UnitId) -> StorageResult<Vec<ReplyJob>> {
        let jobs = lock(&self.jobs)?;
        Ok(sorted_by_creation(
            jobs.values()
                .filter(|j| &j.comment_id == comment_id)
                .cloned()
                .collect(),
        ))
    }

    async fn compare_and_set(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> StorageResult<bool> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if job.status != expected {
            return Ok(false);
        }
        job.status = next;
        if next.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn resolve(
        &self,
        job_id: &JobId,
        resolution: JobResolution,
        attempts: u32,
    ) -> StorageResult<()> {
        let mut jobs = lock(&self.jobs)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        if job.status != JobStatus::Running {
            return Err(StorageError::InvalidJobState {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
                expected: JobStatus::Running.to_string(),
            });
        }
        job.status = resolution.status();
        job.attempts = attempts;
        match resolution {
            JobResolution::Done { reply_id } => job.reply_id = reply_id,
            JobResolution::Failed { reason } => job.failure_reason = Some(reason),
        }
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ReplyJob>> {
        let jobs = lock(&self.jobs)?;
        let mut due: Vec<ReplyJob> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        due.sort_by_key(|j| j.not_before);
        due.truncate(limit);
        Ok(due)
    }

    async fn next_due(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let jobs = lock(&self.jobs)?;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Scheduled)
            .map(|j| j.not_before)
            .min())
    }

    async fn list(&self, status: Option<JobStatus>) -> StorageResult<Vec<ReplyJob>> {
        let jobs = lock(&self.jobs)?;
        Ok(sorted_by_creation(
            jobs.values()
                .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
                .cloned()
                .collect(),
        ))
    }
}
