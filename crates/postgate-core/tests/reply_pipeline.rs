//! End-to-end reply pipeline scenarios over in-memory collaborators and
//! deterministic / fault-injecting gateways.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use postgate_core::gateway::fakes::{Fault, KeywordClassifier, ScriptedGenerator, Step};
use postgate_core::reply::{RecoveryReport, ReplyScheduler, INTERRUPTED_REASON};
use postgate_core::{
    Classifier, Draft, ExecutionOutcome, ModerationOutcome, Pipeline, PipelineConfig, SkipReason,
};
use postgate_state::fakes::{MemoryContentStore, MemoryJobStore, StaticIdentityProvider};
use postgate_state::{
    AutoReplyPolicy, ContentStore, JobStatus, JobStore, ModerationState, NewUnit,
    StorageError, StorageResult, SurrealJobStore, TextUnit, UnitId,
};

const PLACEHOLDER: &str = "[This content has been blocked by moderation]";

struct Harness {
    content: Arc<MemoryContentStore>,
    generator: Arc<ScriptedGenerator>,
    pipeline: Arc<Pipeline>,
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.replies.backoff_base_ms = 10;
    config.replies.max_backoff_ms = 40;
    config.dispatch.poll_interval_ms = 10;
    config
}

fn spam_classifier() -> Arc<dyn Classifier> {
    Arc::new(KeywordClassifier::new(0.95).with_term("pills"))
}

fn harness_with(
    config: PipelineConfig,
    generator: ScriptedGenerator,
    jobs: Arc<dyn JobStore>,
) -> Harness {
    let content = Arc::new(MemoryContentStore::new());
    let generator = Arc::new(generator);
    let identity = StaticIdentityProvider::new()
        .with_token("tok-alice", "alice")
        .with_token("tok-bob", "bob");
    let pipeline = Pipeline::new(
        config,
        content.clone(),
        Arc::new(identity),
        jobs,
        spam_classifier(),
        generator.clone(),
    )
    .unwrap();
    Harness {
        content,
        generator,
        pipeline: Arc::new(pipeline),
    }
}

fn harness(generator: ScriptedGenerator) -> Harness {
    harness_with(fast_config(), generator, Arc::new(MemoryJobStore::new()))
}

impl Harness {
    /// A post by alice with the given policy, plus an allowed comment by bob.
    async fn post_and_comment(&self, policy: AutoReplyPolicy) -> (UnitId, UnitId) {
        let post = self
            .pipeline
            .submit_text("tok-alice", Draft::post("Rust tips", "Prefer iterators."))
            .await
            .unwrap();
        self.content.set_post_policy(&post.unit_id, policy).unwrap();

        let comment = self
            .pipeline
            .submit_text(
                "tok-bob",
                Draft::comment(post.unit_id.clone(), "Great post, thanks!"),
            )
            .await
            .unwrap();
        assert_eq!(comment.outcome, ModerationOutcome::Allowed);
        (post.unit_id, comment.unit_id)
    }

    async fn replies_to(&self, comment_id: &UnitId) -> Vec<TextUnit> {
        self.content.list_children(comment_id).await.unwrap()
    }
}

#[tokio::test]
async fn zero_delay_comment_gets_exactly_one_marked_reply() {
    let h = harness(ScriptedGenerator::replying("\"Glad it helped!\""));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.replied, 1);

    let replies = h.replies_to(&comment).await;
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.parent_id.as_ref(), Some(&comment));
    assert!(reply.is_auto_reply);
    assert_eq!(reply.author_id.as_str(), "system:auto-reply");
    assert_eq!(reply.moderation_state, ModerationState::Allowed);
    assert_eq!(reply.visible_text(), Some("[Auto-reply] Glad it helped!"));

    let jobs = h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Done);
    assert_eq!(jobs[0].reply_id.as_ref(), Some(&reply.id));
    assert_eq!(jobs[0].attempts, 1);

    // A second pass finds nothing to do.
    let again = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(again.claimed, 0);
    assert_eq!(h.replies_to(&comment).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_passes_produce_one_reply() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&h.pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.dispatcher().run_once().await.unwrap()
        }));
    }
    let reports = futures::future::join_all(handles).await;
    let claimed: usize = reports.into_iter().map(|r| r.unwrap().claimed).sum();

    assert_eq!(claimed, 1);
    assert_eq!(h.replies_to(&comment).await.len(), 1);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatch_over_surreal_store_produces_one_reply() {
    let jobs: Arc<dyn JobStore> = Arc::new(SurrealJobStore::in_memory().await.unwrap());
    let h = harness_with(fast_config(), ScriptedGenerator::replying("Thanks!"), jobs);
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pipeline = Arc::clone(&h.pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.dispatcher().run_once().await.unwrap()
        }));
    }
    futures::future::join_all(handles).await;

    assert_eq!(h.replies_to(&comment).await.len(), 1);
    let jobs = h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Done);
}

#[tokio::test]
async fn cancelled_job_never_produces_a_reply() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (_post, comment) = h
        .post_and_comment(AutoReplyPolicy::enabled_after(3600))
        .await;

    assert!(h.pipeline.cancel_reply(&comment).await.unwrap());

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert!(h.replies_to(&comment).await.is_empty());
    assert_eq!(h.generator.calls(), 0);

    let jobs = h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Cancelled);
}

#[tokio::test]
async fn job_waits_for_its_delay() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (_post, comment) = h
        .post_and_comment(AutoReplyPolicy::enabled_after(3600))
        .await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.claimed, 0);
    let jobs = h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Scheduled);
}

#[tokio::test(start_paused = true)]
async fn generator_timing_out_every_attempt_fails_after_bounded_attempts() {
    let h = harness(ScriptedGenerator::failing(Fault::Hang));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.generator.calls(), 3);
    assert!(h.replies_to(&comment).await.is_empty());

    let job = &h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("timed out")));
}

#[tokio::test(start_paused = true)]
async fn rejection_is_not_retried() {
    let h = harness(ScriptedGenerator::failing(Fault::Rejected));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.generator.calls(), 1);
    assert!(h.replies_to(&comment).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_outage_recovers_within_attempt_budget() {
    let h = harness(ScriptedGenerator::new(vec![
        Step::Fail(Fault::Unavailable),
        Step::Reply("Thanks for reading!".to_string()),
    ]));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.replied, 1);
    assert_eq!(h.generator.calls(), 2);

    let job = &h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap()[0];
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn empty_generation_fails_without_retry() {
    let h = harness(ScriptedGenerator::replying("  \"\"  "));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.generator.calls(), 1);
    assert!(h.replies_to(&comment).await.is_empty());
}

#[tokio::test]
async fn blocked_generated_reply_is_stored_with_placeholder() {
    let h = harness(ScriptedGenerator::replying("buy cheap pills now"));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.replied, 1);

    let replies = h.replies_to(&comment).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].moderation_state, ModerationState::Blocked);
    assert_eq!(
        replies[0].visible_text(),
        Some(format!("[Auto-reply] {PLACEHOLDER}").as_str())
    );
    assert!(!replies[0].stored_text.contains("pills"));
}

#[tokio::test]
async fn policy_disabled_after_scheduling_skips_silently() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;
    h.content
        .set_post_policy(&post, AutoReplyPolicy::disabled())
        .unwrap();

    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(h.generator.calls(), 0);

    let job = &h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Done);
    assert!(job.reply_id.is_none());
}

#[tokio::test]
async fn deleted_comment_skips_silently() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;
    h.content.delete_unit(&comment).unwrap();

    let claimed = h
        .pipeline
        .scheduler()
        .claim_due(chrono::Utc::now(), 10)
        .await
        .unwrap();
    let outcome = h.pipeline.executor().run(claimed[0].clone()).await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Skipped(SkipReason::CommentGone));
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test]
async fn existing_auto_reply_blocks_a_second_one() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;
    h.pipeline.dispatcher().run_once().await.unwrap();

    // An operator schedules another job for the same comment.
    h.pipeline
        .schedule_reply(&comment, &post, Duration::ZERO)
        .await
        .unwrap();
    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(h.replies_to(&comment).await.len(), 1);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn replay_reruns_a_failed_job() {
    let h = harness(ScriptedGenerator::new(vec![
        Step::Fail(Fault::Rejected),
        Step::Reply("Second time lucky".to_string()),
    ]));
    let (_post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;
    h.pipeline.dispatcher().run_once().await.unwrap();

    let failed = h.pipeline.scheduler().jobs(Some(JobStatus::Failed)).await.unwrap();
    assert_eq!(failed.len(), 1);

    h.pipeline.replay_failed(&failed[0].job_id).await.unwrap();
    let report = h.pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.replied, 1);
    assert_eq!(h.replies_to(&comment).await.len(), 1);
}

// ---------------------------------------------------------------------------
// Persistence failure after generation
// ---------------------------------------------------------------------------

/// Which step of persisting an auto-reply should fail.
#[derive(Clone, Copy, PartialEq)]
enum ReplyFault {
    Create,
    Finalize,
}

/// Content store that fails one step of auto-reply persistence until healed.
struct FlakyReplyStore {
    inner: Arc<MemoryContentStore>,
    fault: ReplyFault,
    healthy: AtomicBool,
}

impl FlakyReplyStore {
    fn new(inner: Arc<MemoryContentStore>, fault: ReplyFault) -> Self {
        Self {
            inner,
            fault,
            healthy: AtomicBool::new(false),
        }
    }

    fn heal(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }

    fn failing(&self, step: ReplyFault) -> bool {
        self.fault == step && !self.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for FlakyReplyStore {
    async fn get_unit(&self, id: &UnitId) -> StorageResult<TextUnit> {
        self.inner.get_unit(id).await
    }

    async fn create_unit(&self, unit: NewUnit) -> StorageResult<TextUnit> {
        if unit.is_auto_reply && self.failing(ReplyFault::Create) {
            return Err(StorageError::Backend("disk full".to_string()));
        }
        self.inner.create_unit(unit).await
    }

    async fn update_unit_state(
        &self,
        id: &UnitId,
        state: ModerationState,
        stored_text: String,
    ) -> StorageResult<()> {
        let is_auto_reply = self.inner.get_unit(id).await?.is_auto_reply;
        if is_auto_reply && self.failing(ReplyFault::Finalize) {
            return Err(StorageError::Backend("write timed out".to_string()));
        }
        self.inner.update_unit_state(id, state, stored_text).await
    }

    async fn revise_unit(&self, id: &UnitId, raw_text: String) -> StorageResult<TextUnit> {
        self.inner.revise_unit(id, raw_text).await
    }

    async fn get_post_policy(&self, post_id: &UnitId) -> StorageResult<AutoReplyPolicy> {
        self.inner.get_post_policy(post_id).await
    }

    async fn list_children(&self, parent_id: &UnitId) -> StorageResult<Vec<TextUnit>> {
        self.inner.list_children(parent_id).await
    }
}

/// Pipeline over `store` with an allowed comment on a zero-delay post.
async fn flaky_pipeline(
    inner: &MemoryContentStore,
    store: Arc<FlakyReplyStore>,
    generator: Arc<ScriptedGenerator>,
) -> (Pipeline, UnitId) {
    let pipeline = Pipeline::new(
        fast_config(),
        store,
        Arc::new(StaticIdentityProvider::new().with_token("tok-alice", "alice")),
        Arc::new(MemoryJobStore::new()),
        spam_classifier(),
        generator,
    )
    .unwrap();

    let post = pipeline
        .submit_text("tok-alice", Draft::post("t", "body"))
        .await
        .unwrap();
    inner
        .set_post_policy(&post.unit_id, AutoReplyPolicy::enabled_after(0))
        .unwrap();
    let comment = pipeline
        .submit_text("tok-alice", Draft::comment(post.unit_id.clone(), "hello"))
        .await
        .unwrap();
    (pipeline, comment.unit_id)
}

#[tokio::test]
async fn persistence_failure_leaves_job_failed_without_retry() {
    let inner = Arc::new(MemoryContentStore::new());
    let store = Arc::new(FlakyReplyStore::new(inner.clone(), ReplyFault::Create));
    let generator = Arc::new(ScriptedGenerator::replying("Thanks!"));
    let (pipeline, comment) = flaky_pipeline(&inner, store, generator.clone()).await;

    let report = pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(generator.calls(), 1);

    let job = &pipeline.scheduler().jobs_for_comment(&comment).await.unwrap()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("disk full")));

    // Nothing re-arms it on the next pass.
    let again = pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(again.claimed, 0);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn replay_after_unfinished_persist_publishes_a_visible_reply() {
    let inner = Arc::new(MemoryContentStore::new());
    let store = Arc::new(FlakyReplyStore::new(inner.clone(), ReplyFault::Finalize));
    let generator = Arc::new(ScriptedGenerator::replying("Thanks!"));
    let (pipeline, comment) = flaky_pipeline(&inner, store.clone(), generator.clone()).await;

    let report = pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    let orphans = inner.list_children(&comment).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].moderation_state, ModerationState::Pending);
    assert_eq!(orphans[0].visible_text(), None);

    store.heal();
    let failed = pipeline.scheduler().jobs(Some(JobStatus::Failed)).await.unwrap();
    pipeline.replay_failed(&failed[0].job_id).await.unwrap();

    let report = pipeline.dispatcher().run_once().await.unwrap();
    assert_eq!(report.replied, 1);
    assert_eq!(generator.calls(), 2);

    let visible: Vec<_> = inner
        .list_children(&comment)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.moderation_state == ModerationState::Allowed)
        .collect();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].visible_text(), Some("[Auto-reply] Thanks!"));
}

// ---------------------------------------------------------------------------
// Long-running loop and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_loop_recovers_then_drains_until_shutdown() {
    let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let h = harness_with(fast_config(), ScriptedGenerator::replying("Thanks!"), jobs);
    let (post, comment) = h.post_and_comment(AutoReplyPolicy::enabled_after(0)).await;

    // Simulate a job left RUNNING by a crashed process.
    let stuck = h.pipeline.scheduler().claim_due(chrono::Utc::now(), 10).await.unwrap();
    assert_eq!(stuck.len(), 1);

    let second = h
        .pipeline
        .submit_text("tok-bob", Draft::comment(post.clone(), "Another question"))
        .await
        .unwrap();
    assert!(second.reply_job.is_some());

    let (tx, rx) = tokio::sync::watch::channel(false);
    let dispatcher = h.pipeline.dispatcher();
    let handle = tokio::spawn(async move { dispatcher.run(rx).await });

    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !h.replies_to(&second.unit_id).await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "second comment was never answered");

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let interrupted = &h.pipeline.scheduler().jobs_for_comment(&comment).await.unwrap()[0];
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(interrupted.failure_reason.as_deref(), Some(INTERRUPTED_REASON));
    assert!(h.replies_to(&comment).await.is_empty());
}

#[tokio::test]
async fn run_loop_stops_when_shutdown_sender_is_dropped() {
    let h = harness(ScriptedGenerator::replying("Thanks!"));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let dispatcher = h.pipeline.dispatcher();
    let handle = tokio::spawn(async move { dispatcher.run(rx).await });

    drop(tx);
    let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(finished.is_ok());
}

#[tokio::test]
async fn scheduled_jobs_survive_reopening_the_durable_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("surrealkv://{}", dir.path().join("jobs").display());
    let post = UnitId::from("post-1");
    let (waiting, interrupted) = (UnitId::from("c-waiting"), UnitId::from("c-interrupted"));

    let (waiting_job, interrupted_job) = {
        let store = SurrealJobStore::connect(&url).await.unwrap();
        let scheduler = ReplyScheduler::new(Arc::new(store));
        let waiting_job = scheduler
            .enqueue(&waiting, &post, Duration::from_secs(3600))
            .await
            .unwrap();
        let interrupted_job = scheduler
            .enqueue(&interrupted, &post, Duration::ZERO)
            .await
            .unwrap();
        let claimed = scheduler.claim_due(chrono::Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, interrupted_job.job_id);
        (waiting_job, interrupted_job)
    };

    let store = SurrealJobStore::connect(&url).await.unwrap();
    let scheduler = ReplyScheduler::new(Arc::new(store));
    let report = scheduler.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            rearmed: 1,
            failed: 1
        }
    );

    let kept = scheduler.job(&waiting_job.job_id).await.unwrap();
    assert_eq!(kept.status, JobStatus::Scheduled);
    assert_eq!(
        kept.not_before.timestamp_millis(),
        waiting_job.not_before.timestamp_millis()
    );

    let failed = scheduler.job(&interrupted_job.job_id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some(INTERRUPTED_REASON));
}
