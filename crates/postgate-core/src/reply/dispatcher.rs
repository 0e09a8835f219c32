//! Dispatch loop: claims due jobs and drains them through a bounded worker pool.

use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::Result;

use super::executor::{ExecutionOutcome, ReplyExecutor};
use super::scheduler::ReplyScheduler;

/// Tally of one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Jobs whose terminal state could not be recorded.
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &Result<ExecutionOutcome>) {
        match outcome {
            Ok(ExecutionOutcome::Replied { .. }) => self.replied += 1,
            Ok(ExecutionOutcome::Skipped(_)) => self.skipped += 1,
            Ok(ExecutionOutcome::Failed { .. }) => self.failed += 1,
            Err(_) => self.errors += 1,
        }
    }
}

pub struct Dispatcher {
    scheduler: ReplyScheduler,
    executor: ReplyExecutor,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(scheduler: ReplyScheduler, executor: ReplyExecutor, config: DispatchConfig) -> Self {
        Self {
            scheduler,
            executor,
            config,
        }
    }

    /// Claim one batch of due jobs and run them, at most `worker_count` at a time.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let claimed = self
            .scheduler
            .claim_due(Utc::now(), self.config.batch_size)
            .await?;

        let report = Mutex::new(DispatchReport {
            claimed: claimed.len(),
            ..DispatchReport::default()
        });

        stream::iter(claimed)
            .for_each_concurrent(self.config.worker_count.max(1), |job| {
                let report = &report;
                async move {
                    let job_id = job.job_id.clone();
                    let outcome = self.executor.run(job).await;
                    if let Err(e) = &outcome {
                        warn!(job_id = %job_id, error = %e, "could not record job outcome");
                    }
                    report.lock().await.record(&outcome);
                }
            })
            .await;

        Ok(report.into_inner())
    }

    /// Recover once, then dispatch until `shutdown` turns true or its sender is dropped.
    ///
    /// Between passes the loop sleeps until the earliest due job, an enqueue
    /// notification, or the poll interval, whichever comes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let recovered = self.scheduler.recover().await?;
        info!(
            rearmed = recovered.rearmed,
            failed = recovered.failed,
            "dispatcher recovered job table"
        );
        let wake = self.scheduler.wake_handle();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    debug!(?report, "dispatch pass");
                    if report.claimed >= self.config.batch_size {
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dispatch pass failed"),
            }

            let pause = self.pause().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("dispatcher stopped");
        Ok(())
    }

    async fn pause(&self) -> Duration {
        let poll = self.config.poll_interval();
        match self.scheduler.next_due().await {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
            Ok(None) => poll,
            Err(e) => {
                warn!(error = %e, "could not read next due job");
                poll
            }
        }
    }
}
