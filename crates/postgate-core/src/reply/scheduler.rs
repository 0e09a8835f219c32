//! Reply job scheduling over a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgate_state::{JobId, JobResolution, JobStatus, JobStore, ReplyJob, UnitId};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{PostgateError, Result};
use crate::obs::{self, JobSpan};

/// Failure reason recorded for jobs found RUNNING at startup.
pub const INTERRUPTED_REASON: &str = "interrupted: process restarted while running";

/// What [`ReplyScheduler::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// SCHEDULED jobs that stay armed with their original `not_before`.
    pub rearmed: usize,
    /// RUNNING jobs resolved as FAILED.
    pub failed: usize,
}

/// Owns every reply job state transition except the executor's outcome
/// bookkeeping, which also goes through here.
#[derive(Clone)]
pub struct ReplyScheduler {
    jobs: Arc<dyn JobStore>,
    wake: Arc<Notify>,
}

impl ReplyScheduler {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self {
            jobs,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a job becomes due earlier than a sleeping
    /// dispatcher may expect.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Record intent to reply to `comment_id` once `delay` has passed.
    ///
    /// Fails with `DuplicateJob` while another job for the comment is
    /// SCHEDULED or RUNNING.
    pub async fn enqueue(
        &self,
        comment_id: &UnitId,
        post_id: &UnitId,
        delay: Duration,
    ) -> Result<ReplyJob> {
        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or_else(|| {
                PostgateError::InvalidRequest(format!(
                    "delay of {}s is out of range",
                    delay.as_secs()
                ))
            })?;
        let job = ReplyJob::scheduled(comment_id.clone(), post_id.clone(), not_before);

        self.jobs.insert(job.clone()).await?;
        obs::emit_job_scheduled(job.job_id.as_str(), comment_id.as_str(), delay.as_secs());
        self.wake.notify_one();
        Ok(job)
    }

    /// Cancel the comment's SCHEDULED job.
    ///
    /// Returns `false` when there was nothing to cancel: no job, a RUNNING
    /// job (which runs to completion), or a job that was claimed between
    /// the lookup and the transition.
    pub async fn cancel(&self, comment_id: &UnitId) -> Result<bool> {
        let Some(job) = self.jobs.active_for_comment(comment_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Scheduled {
            debug!(job_id = %job.job_id, status = %job.status, "cancel skipped");
            return Ok(false);
        }

        let cancelled = self
            .jobs
            .compare_and_set(&job.job_id, JobStatus::Scheduled, JobStatus::Cancelled)
            .await?;
        if cancelled {
            obs::emit_job_cancelled(job.job_id.as_str(), comment_id.as_str());
        }
        Ok(cancelled)
    }

    /// Claim up to `limit` due jobs, moving each SCHEDULED -> RUNNING.
    ///
    /// Only jobs whose transition this caller won are returned.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ReplyJob>> {
        let candidates = self.jobs.due(now, limit).await?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut job in candidates {
            let won = self
                .jobs
                .compare_and_set(&job.job_id, JobStatus::Scheduled, JobStatus::Running)
                .await?;
            if !won {
                continue;
            }
            job.status = JobStatus::Running;
            {
                let _span = JobSpan::enter(job.job_id.as_str());
                obs::emit_job_claimed(job.job_id.as_str(), job.comment_id.as_str());
            }
            claimed.push(job);
        }
        Ok(claimed)
    }

    /// Mark a RUNNING job DONE.
    pub async fn complete(
        &self,
        job_id: &JobId,
        reply_id: Option<UnitId>,
        attempts: u32,
    ) -> Result<()> {
        self.jobs
            .resolve(job_id, JobResolution::Done { reply_id }, attempts)
            .await?;
        obs::emit_job_finished(job_id.as_str(), JobStatus::Done.as_str(), attempts, None);
        Ok(())
    }

    /// Mark a RUNNING job FAILED with `reason`.
    pub async fn fail(&self, job_id: &JobId, reason: &str, attempts: u32) -> Result<()> {
        self.jobs
            .resolve(
                job_id,
                JobResolution::Failed {
                    reason: reason.to_string(),
                },
                attempts,
            )
            .await?;
        obs::emit_job_finished(
            job_id.as_str(),
            JobStatus::Failed.as_str(),
            attempts,
            Some(reason),
        );
        Ok(())
    }

    /// Bring the job table back to a consistent state after a restart.
    ///
    /// RUNNING jobs are failed rather than re-run: the generator call may
    /// already have produced a reply. SCHEDULED jobs keep their original
    /// `not_before`. Call once, before any dispatcher starts claiming.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for job in self.jobs.list(Some(JobStatus::Running)).await? {
            self.jobs
                .resolve(
                    &job.job_id,
                    JobResolution::Failed {
                        reason: INTERRUPTED_REASON.to_string(),
                    },
                    job.attempts,
                )
                .await?;
            obs::emit_job_recovered(job.job_id.as_str(), JobStatus::Failed.as_str());
            report.failed += 1;
        }

        report.rearmed = self.jobs.list(Some(JobStatus::Scheduled)).await?.len();
        if report.rearmed > 0 {
            self.wake.notify_one();
        }
        Ok(report)
    }

    /// Schedule a fresh, immediately due job for the comment of a FAILED job.
    pub async fn replay(&self, job_id: &JobId) -> Result<ReplyJob> {
        let failed = self.jobs.get(job_id).await?;
        if failed.status != JobStatus::Failed {
            return Err(PostgateError::InvalidRequest(format!(
                "only FAILED jobs can be replayed; {} is {}",
                job_id, failed.status
            )));
        }
        self.enqueue(&failed.comment_id, &failed.post_id, Duration::ZERO)
            .await
    }

    /// Earliest `not_before` among SCHEDULED jobs.
    pub async fn next_due(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.jobs.next_due().await?)
    }

    pub async fn job(&self, job_id: &JobId) -> Result<ReplyJob> {
        Ok(self.jobs.get(job_id).await?)
    }

    pub async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ReplyJob>> {
        Ok(self.jobs.list(status).await?)
    }

    pub async fn jobs_for_comment(&self, comment_id: &UnitId) -> Result<Vec<ReplyJob>> {
        Ok(self.jobs.jobs_for_comment(comment_id).await?)
    }
}
