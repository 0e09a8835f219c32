//! SurrealDB-backed JobStore implementation
//!
//! Uses `schema::ReplyJobRow` for persistence, converting to/from
//! `storage_traits` types at the boundary. Status transitions are issued as
//! `UPDATE ... WHERE job_id = $jid AND status = $expected`, so only one of
//! several racing dispatchers sees its update applied.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::ReplyJobRow;
use crate::storage_traits::{
    JobId, JobResolution, JobStatus, JobStore, ReplyJob, StorageResult, UnitId,
};

const NAMESPACE: &str = "postgate";
const DATABASE: &str = "main";

/// Default on-disk location used when no URL is configured.
pub const DEFAULT_DB_URL: &str = "surrealkv://.postgate/db";

/// SurrealDB-backed implementation of [`JobStore`].
#[derive(Clone)]
pub struct SurrealJobStore {
    db: Surreal<Any>,
}

fn backend(err: surrealdb::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

impl SurrealJobStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://...`).
    ///
    /// Local `surrealkv://` directories are created if missing.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> crate::Result<Self> {
        if let Some(path) = url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
        }

        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealJobStore connected");
        Ok(Self { db })
    }

    /// Connect using `SURREALDB_URL`, falling back to [`DEFAULT_DB_URL`].
    pub async fn from_env() -> crate::Result<Self> {
        let url = std::env::var("SURREALDB_URL").unwrap_or_else(|_| DEFAULT_DB_URL.to_string());
        Self::connect(&url).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_row(&self, job_id: &str) -> StorageResult<ReplyJobRow> {
        let jid = job_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM reply_jobs WHERE job_id = $jid")
            .bind(("jid", jid))
            .await
            .map_err(backend)?;

        let rows: Vec<ReplyJobRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Replace a row only if it is still in `expected`. Returns whether it was applied.
    async fn conditional_update(
        &self,
        row: ReplyJobRow,
        expected: JobStatus,
    ) -> StorageResult<bool> {
        let jid = row.job_id.clone();
        let result = self
            .db
            .query("UPDATE reply_jobs CONTENT $row WHERE job_id = $jid AND status = $expected RETURN AFTER")
            .bind(("row", row))
            .bind(("jid", jid))
            .bind(("expected", expected.as_str().to_string()))
            .await;

        let mut res = match result {
            Ok(res) => res,
            Err(e) if is_write_conflict(&e) => return Ok(false),
            Err(e) => return Err(backend(e)),
        };

        match res.take::<Vec<ReplyJobRow>>(0) {
            Ok(rows) => Ok(!rows.is_empty()),
            // A conflicting concurrent transaction won the row.
            Err(e) if is_write_conflict(&e) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }

    async fn select_rows(
        &self,
        sql: &str,
        binds: Vec<(&'static str, String)>,
    ) -> StorageResult<Vec<ReplyJob>> {
        let mut query = self.db.query(sql.to_string());
        for (name, value) in binds {
            query = query.bind((name, value));
        }
        let mut res = query.await.map_err(backend)?;
        let rows: Vec<ReplyJobRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ReplyJobRow::into_job).collect()
    }
}

fn is_write_conflict(err: &surrealdb::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("conflict") || msg.contains("can be retried")
}

#[async_trait]
impl JobStore for SurrealJobStore {
    async fn insert(&self, job: ReplyJob) -> StorageResult<()> {
        if job.status != JobStatus::Scheduled {
            return Err(StorageError::InvalidJobState {
                job_id: job.job_id.to_string(),
                status: job.status.to_string(),
                expected: JobStatus::Scheduled.to_string(),
            });
        }

        debug!(job_id = %job.job_id, comment_id = %job.comment_id, "inserting reply job");

        let row = ReplyJobRow::from_job(&job);
        let created: Result<Option<ReplyJobRow>, surrealdb::Error> = self
            .db
            .create(("reply_jobs", job.job_id.0.clone()))
            .content(row)
            .await;

        let duplicate = || StorageError::DuplicateJob {
            comment_id: job.comment_id.to_string(),
        };
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("idx_active_slot") => Err(duplicate()),
            // A concurrent enqueue for the same comment may surface as a
            // transaction conflict instead of an index violation.
            Err(e) if is_write_conflict(&e) => {
                match self.active_for_comment(&job.comment_id).await? {
                    Some(_) => Err(duplicate()),
                    None => Err(backend(e)),
                }
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get(&self, job_id: &JobId) -> StorageResult<ReplyJob> {
        self.fetch_row(&job_id.0).await?.into_job()
    }

    async fn active_for_comment(&self, comment_id: &UnitId) -> StorageResult<Option<ReplyJob>> {
        let jobs = self
            .select_rows(
                "SELECT * FROM reply_jobs WHERE active_slot = $cid",
                vec![("cid", comment_id.0.clone())],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn jobs_for_comment(&self, comment_id: &UnitId) -> StorageResult<Vec<ReplyJob>> {
        self.select_rows(
            "SELECT * FROM reply_jobs WHERE comment_id = $cid ORDER BY created_at ASC",
            vec![("cid", comment_id.0.clone())],
        )
        .await
    }

    async fn compare_and_set(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> StorageResult<bool> {
        let row = self.fetch_row(&job_id.0).await?;
        if row.status != expected.as_str() {
            return Ok(false);
        }
        self.conditional_update(row.transition(next), expected).await
    }

    async fn resolve(
        &self,
        job_id: &JobId,
        resolution: JobResolution,
        attempts: u32,
    ) -> StorageResult<()> {
        let row = self.fetch_row(&job_id.0).await?;
        if row.status != JobStatus::Running.as_str() {
            return Err(StorageError::InvalidJobState {
                job_id: job_id.to_string(),
                status: row.status,
                expected: JobStatus::Running.to_string(),
            });
        }

        let applied = self
            .conditional_update(row.resolve(resolution, attempts), JobStatus::Running)
            .await?;
        if !applied {
            let current = self.fetch_row(&job_id.0).await?;
            return Err(StorageError::InvalidJobState {
                job_id: job_id.to_string(),
                status: current.status,
                expected: JobStatus::Running.to_string(),
            });
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> StorageResult<Vec<ReplyJob>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT * FROM reply_jobs WHERE status = 'SCHEDULED' AND not_before_ms <= $now \
                 ORDER BY not_before_ms ASC LIMIT {limit}"
            ))
            .bind(("now", now.timestamp_millis()))
            .await
            .map_err(backend)?;
        let rows: Vec<ReplyJobRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ReplyJobRow::into_job).collect()
    }

    async fn next_due(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let jobs = self
            .select_rows(
                "SELECT * FROM reply_jobs WHERE status = 'SCHEDULED' ORDER BY not_before_ms ASC LIMIT 1",
                Vec::new(),
            )
            .await?;
        Ok(jobs.into_iter().next().map(|j| j.not_before))
    }

    async fn list(&self, status: Option<JobStatus>) -> StorageResult<Vec<ReplyJob>> {
        match status {
            Some(status) => {
                self.select_rows(
                    "SELECT * FROM reply_jobs WHERE status = $status ORDER BY created_at ASC",
                    vec![("status", status.as_str().to_string())],
                )
                .await
            }
            None => {
                self.select_rows(
                    "SELECT * FROM reply_jobs ORDER BY created_at ASC",
                    Vec::new(),
                )
                .await
            }
        }
    }
}
