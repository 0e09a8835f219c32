//! postgate - operator CLI for the moderation and auto-reply pipeline
//!
//! ## Commands
//!
//! - `moderate`: Dry-run the moderation gate against the configured classifier
//! - `jobs list` / `jobs show`: Inspect the reply job table
//! - `jobs cancel`: Cancel a comment's scheduled reply
//! - `jobs replay`: Re-schedule a FAILED job
//! - `recover`: Fail jobs left RUNNING by a crashed process

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use postgate_core::{
    FailurePolicy, GateDecision, GatewayConfig, HttpClassifier, ModerationConfig, ModerationGate,
    PipelineConfig, ReplyScheduler, UpstreamConfig,
};
use postgate_state::{JobId, JobStatus, ReplyJob, SurrealJobStore, UnitId, DEFAULT_DB_URL};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "postgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Moderation gate and auto-reply job control", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and command output
    #[arg(long, global = true)]
    json: bool,

    /// Reply job store URL (mem:// or surrealkv://<path>)
    #[arg(long, global = true, env = "SURREALDB_URL", default_value = DEFAULT_DB_URL)]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run text through the moderation gate without storing anything
    Moderate {
        /// Text to evaluate
        text: String,

        #[command(flatten)]
        gate: GateArgs,
    },

    /// Inspect and control reply jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Resolve jobs left RUNNING by a previous process as FAILED
    Recover,
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs, oldest first
    List {
        /// Only show jobs in this state (scheduled, running, done, failed, cancelled)
        #[arg(short, long)]
        status: Option<JobStatus>,
    },

    /// Show a single job
    Show { job_id: String },

    /// Cancel the SCHEDULED reply for a comment
    Cancel { comment_id: String },

    /// Schedule a fresh, immediately due job for a FAILED job's comment
    Replay { job_id: String },
}

/// Classifier and gate settings for `moderate`.
#[derive(clap::Args, Debug)]
struct GateArgs {
    /// Model API base URL
    #[arg(long, env = "POSTGATE_ENDPOINT", default_value = "https://generativelanguage.googleapis.com/v1beta")]
    endpoint: String,

    /// Model API key
    #[arg(long, env = "POSTGATE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Classifier model name
    #[arg(long, env = "POSTGATE_CLASSIFIER_MODEL", default_value = "gemini-pro")]
    model: String,

    /// Flagged verdicts at or above this confidence are blocked
    #[arg(long, env = "POSTGATE_CONFIDENCE_THRESHOLD", default_value_t = 0.8)]
    threshold: f32,

    /// What to do when the classifier fails (fail-closed or fail-open)
    #[arg(long, env = "POSTGATE_FAILURE_POLICY", default_value = "fail-closed")]
    failure_policy: FailurePolicy,

    /// Hard timeout for the classifier call in milliseconds
    #[arg(long, env = "POSTGATE_REQUEST_TIMEOUT_MS", default_value_t = 5_000)]
    timeout_ms: u64,

    /// Skip the classifier and allow everything
    #[arg(long, env = "POSTGATE_CLASSIFIER_DISABLED")]
    classifier_disabled: bool,
}

impl GateArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let config = PipelineConfig {
            gateways: GatewayConfig {
                classifier_enabled: !self.classifier_disabled,
                request_timeout_ms: self.timeout_ms,
                ..GatewayConfig::default()
            },
            moderation: ModerationConfig {
                confidence_threshold: self.threshold,
                failure_policy: self.failure_policy,
                ..ModerationConfig::default()
            },
            upstream: UpstreamConfig {
                endpoint: self.endpoint.clone(),
                api_key: self.api_key.clone(),
                classifier_model: self.model.clone(),
                ..UpstreamConfig::default()
            },
            ..PipelineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    postgate_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Moderate { text, gate } => cmd_moderate(&text, &gate, cli.json).await,
        Commands::Jobs { action } => {
            let scheduler = open_scheduler(&cli.db).await?;
            match action {
                JobsAction::List { status } => cmd_jobs_list(&scheduler, status, cli.json).await,
                JobsAction::Show { job_id } => cmd_jobs_show(&scheduler, &job_id, cli.json).await,
                JobsAction::Cancel { comment_id } => cmd_jobs_cancel(&scheduler, &comment_id).await,
                JobsAction::Replay { job_id } => cmd_jobs_replay(&scheduler, &job_id).await,
            }
        }
        Commands::Recover => {
            let scheduler = open_scheduler(&cli.db).await?;
            cmd_recover(&scheduler, cli.json).await
        }
    }
}

async fn open_scheduler(url: &str) -> Result<ReplyScheduler> {
    let store = SurrealJobStore::connect(url)
        .await
        .with_context(|| format!("Failed to open reply job store at {url}"))?;
    Ok(ReplyScheduler::new(Arc::new(store)))
}

/// Dry-run the gate
async fn cmd_moderate(text: &str, args: &GateArgs, json: bool) -> Result<()> {
    let config = args.pipeline_config()?;
    let classifier = HttpClassifier::new(&config.upstream, &config.gateways)
        .context("Failed to build classifier client")?;
    let gate = ModerationGate::new(Arc::new(classifier), config.moderation, config.gateways);

    let decision = gate.evaluate(text).await;
    println!("{}", render_decision(&decision, json)?);
    Ok(())
}

fn render_decision(decision: &GateDecision, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(decision)?);
    }
    Ok(format!(
        "Outcome: {}\nSource:  {}\nReason:  {}\nLatency: {}ms\nStored:  {}",
        decision.outcome,
        decision.verdict.source.as_str(),
        decision.verdict.reason,
        decision.verdict.classifier_latency.as_millis(),
        decision.stored_text
    ))
}

fn render_job(job: &ReplyJob) -> String {
    let mut out = format!(
        "job {}\nStatus:     {}\nComment:    {}\nPost:       {}\nNot before: {}\nAttempts:   {}",
        job.job_id,
        job.status,
        job.comment_id,
        job.post_id,
        job.not_before.format("%Y-%m-%d %H:%M:%S UTC"),
        job.attempts,
    );
    if let Some(reply_id) = &job.reply_id {
        out.push_str(&format!("\nReply:      {reply_id}"));
    }
    if let Some(reason) = &job.failure_reason {
        out.push_str(&format!("\nReason:     {reason}"));
    }
    if let Some(finished) = job.finished_at {
        out.push_str(&format!(
            "\nFinished:   {}",
            finished.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    out
}

fn render_job_line(job: &ReplyJob) -> String {
    format!(
        "{}  {:<9}  comment={}  not_before={}",
        job.job_id,
        job.status.as_str(),
        job.comment_id,
        job.not_before.format("%Y-%m-%d %H:%M:%S"),
    )
}

async fn cmd_jobs_list(
    scheduler: &ReplyScheduler,
    status: Option<JobStatus>,
    json: bool,
) -> Result<()> {
    let jobs = scheduler.jobs(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No reply jobs found");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", render_job_line(job));
    }
    Ok(())
}

async fn cmd_jobs_show(scheduler: &ReplyScheduler, job_id: &str, json: bool) -> Result<()> {
    let job = scheduler
        .job(&JobId::from(job_id))
        .await
        .with_context(|| format!("Failed to load job {job_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        println!("{}", render_job(&job));
    }
    Ok(())
}

async fn cmd_jobs_cancel(scheduler: &ReplyScheduler, comment_id: &str) -> Result<()> {
    let cancelled = scheduler.cancel(&UnitId::from(comment_id)).await?;
    if cancelled {
        println!("Cancelled scheduled reply for comment {comment_id}");
    } else {
        println!("No scheduled reply to cancel for comment {comment_id}");
    }
    Ok(())
}

async fn cmd_jobs_replay(scheduler: &ReplyScheduler, job_id: &str) -> Result<()> {
    let job = scheduler
        .replay(&JobId::from(job_id))
        .await
        .with_context(|| format!("Failed to replay job {job_id}"))?;
    info!(job_id = %job.job_id, "replay scheduled");
    println!("Scheduled job {} for comment {}", job.job_id, job.comment_id);
    Ok(())
}

async fn cmd_recover(scheduler: &ReplyScheduler, json: bool) -> Result<()> {
    let report = scheduler.recover().await.context("Recovery failed")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Re-armed: {}", report.rearmed);
        println!("Failed:   {}", report.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    async fn mem_scheduler() -> ReplyScheduler {
        ReplyScheduler::new(Arc::new(SurrealJobStore::in_memory().await.unwrap()))
    }

    #[test]
    fn parses_jobs_list_with_status() {
        let cli = Cli::try_parse_from(["postgate", "jobs", "list", "--status", "failed"]).unwrap();
        match cli.command {
            Commands::Jobs {
                action: JobsAction::List { status },
            } => assert_eq!(status, Some(JobStatus::Failed)),
            _ => panic!("expected jobs list"),
        }
    }

    #[test]
    fn parses_moderate_with_fail_open() {
        let cli = Cli::try_parse_from([
            "postgate",
            "--db",
            "mem://",
            "moderate",
            "hello",
            "--failure-policy",
            "fail-open",
            "--threshold",
            "0.5",
        ])
        .unwrap();
        assert_eq!(cli.db, "mem://");
        match cli.command {
            Commands::Moderate { text, gate } => {
                assert_eq!(text, "hello");
                let config = gate.pipeline_config().unwrap();
                assert_eq!(config.moderation.failure_policy, FailurePolicy::FailOpen);
                assert!((config.moderation.confidence_threshold - 0.5).abs() < f32::EPSILON);
            }
            _ => panic!("expected moderate"),
        }
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cli = Cli::try_parse_from(["postgate", "moderate", "x", "--threshold", "2.0"]).unwrap();
        match cli.command {
            Commands::Moderate { gate, .. } => assert!(gate.pipeline_config().is_err()),
            _ => panic!("expected moderate"),
        }
    }

    #[tokio::test]
    async fn moderate_with_disabled_classifier_allows() {
        let cli = Cli::try_parse_from(["postgate", "moderate", "hi", "--classifier-disabled"])
            .unwrap();
        let Commands::Moderate { text, gate } = cli.command else {
            panic!("expected moderate");
        };
        cmd_moderate(&text, &gate, true).await.unwrap();
    }

    #[tokio::test]
    async fn job_commands_round_trip_against_memory_store() {
        let scheduler = mem_scheduler().await;
        let job = scheduler
            .enqueue(&UnitId::from("c1"), &UnitId::from("p1"), Duration::from_secs(60))
            .await
            .unwrap();

        cmd_jobs_list(&scheduler, None, false).await.unwrap();
        cmd_jobs_show(&scheduler, job.job_id.as_str(), true).await.unwrap();
        cmd_jobs_cancel(&scheduler, "c1").await.unwrap();

        let cancelled = scheduler.job(&job.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(render_job(&cancelled).contains("Status:     CANCELLED"));

        // Replay refuses non-failed jobs.
        assert!(cmd_jobs_replay(&scheduler, job.job_id.as_str()).await.is_err());
    }

    #[tokio::test]
    async fn recover_fails_running_jobs() {
        let scheduler = mem_scheduler().await;
        scheduler
            .enqueue(&UnitId::from("c1"), &UnitId::from("p1"), Duration::ZERO)
            .await
            .unwrap();
        scheduler.claim_due(Utc::now(), 10).await.unwrap();

        cmd_recover(&scheduler, false).await.unwrap();
        let failed = scheduler.jobs(Some(JobStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);

        cmd_jobs_replay(&scheduler, failed[0].job_id.as_str()).await.unwrap();
        assert_eq!(
            scheduler.jobs(Some(JobStatus::Scheduled)).await.unwrap().len(),
            1
        );
    }
}
