//! Schema definitions for postgate SurrealDB tables
//!
//! Tables:
//! - reply_jobs: Scheduled, running and finished auto-reply jobs

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{
    JobId, JobResolution, JobStatus, ReplyJob, StorageResult, UnitId,
};
use crate::StorageError;

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Reply job row as stored in the `reply_jobs` table.
///
/// `active_slot` carries the at-most-one-in-flight constraint: it equals
/// `comment_id` while the job is non-terminal and `job:<job_id>` once it is
/// terminal, and the table keeps a UNIQUE index on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyJobRow {
    pub job_id: String,
    pub comment_id: String,
    pub post_id: String,
    /// "SCHEDULED" | "CANCELLED" | "RUNNING" | "DONE" | "FAILED"
    pub status: String,
    pub active_slot: String,
    /// `not_before` as epoch milliseconds, for range scans
    pub not_before_ms: i64,
    pub attempts: u64,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub reply_id: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Slot value for a job in the given status.
pub fn active_slot(job_id: &str, comment_id: &str, status: JobStatus) -> String {
    if status.is_terminal() {
        format!("job:{job_id}")
    } else {
        comment_id.to_string()
    }
}

impl ReplyJobRow {
    pub fn from_job(job: &ReplyJob) -> Self {
        ReplyJobRow {
            job_id: job.job_id.0.clone(),
            comment_id: job.comment_id.0.clone(),
            post_id: job.post_id.0.clone(),
            status: job.status.as_str().to_string(),
            active_slot: active_slot(&job.job_id.0, &job.comment_id.0, job.status),
            not_before_ms: job.not_before.timestamp_millis(),
            attempts: u64::from(job.attempts),
            failure_reason: job.failure_reason.clone(),
            reply_id: job.reply_id.as_ref().map(|r| r.0.clone()),
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }

    pub fn into_job(self) -> StorageResult<ReplyJob> {
        let not_before = Utc
            .timestamp_millis_opt(self.not_before_ms)
            .single()
            .ok_or_else(|| {
                StorageError::Backend(format!("invalid not_before: {}", self.not_before_ms))
            })?;
        Ok(ReplyJob {
            job_id: JobId(self.job_id),
            comment_id: UnitId(self.comment_id),
            post_id: UnitId(self.post_id),
            not_before,
            status: self.status.parse()?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            failure_reason: self.failure_reason,
            reply_id: self.reply_id.map(UnitId),
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }

    /// Move to `next`, updating the slot and finish time.
    pub fn transition(mut self, next: JobStatus) -> Self {
        self.status = next.as_str().to_string();
        self.active_slot = active_slot(&self.job_id, &self.comment_id, next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self
    }

    /// Apply a terminal resolution.
    pub fn resolve(self, resolution: JobResolution, attempts: u32) -> Self {
        let mut row = self.transition(resolution.status());
        row.attempts = u64::from(attempts);
        match resolution {
            JobResolution::Done { reply_id } => row.reply_id = reply_id.map(|r| r.0),
            JobResolution::Failed { reason } => row.failure_reason = Some(reason),
        }
        row
    }
}
