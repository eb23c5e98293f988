//! End-to-end orchestration tests: dispatch, workers, retries, admin control
//! and lease recovery, driven through the library API against in-memory
//! SQLite and scripted executors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use repowatch::errors::JobError;
use repowatch::jobs::admin::{self, JobAction};
use repowatch::jobs::context::JobsContext;
use repowatch::jobs::dispatcher::{BatchDispatcher, DispatchFilter, DispatchOutcome, ForkMode};
use repowatch::jobs::executor::JobExecutor;
use repowatch::jobs::models::*;
use repowatch::jobs::status::StatusTracker;
use repowatch::jobs::worker::{JobOutcome, Reaper, Worker, WorkerSettings};

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    Fail,
    Deny,
}

/// Executor that follows a script, records the status it observes while
/// running and tracks how many jobs per key run at once.
struct ScriptedExecutor {
    script: Mutex<Script>,
    delay: Duration,
    calls: AtomicUsize,
    status: StatusTracker,
    observed: Mutex<Vec<ProcessingStatus>>,
    running: Mutex<HashMap<EntityKey, usize>>,
    max_concurrent_per_key: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(ctx: &JobsContext, script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            delay,
            calls: AtomicUsize::new(0),
            status: ctx.status.clone(),
            observed: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            max_concurrent_per_key: AtomicUsize::new(0),
        })
    }

    fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, payload: &JobPayload) -> Result<Artifact, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = payload.key().clone();
        {
            let mut running = self.running.lock().unwrap();
            let n = running.entry(key.clone()).or_default();
            *n += 1;
            self.max_concurrent_per_key.fetch_max(*n, Ordering::SeqCst);
        }

        if let Ok(Some(record)) = self.status.get_status(&key, payload.operation()).await {
            self.observed.lock().unwrap().push(record.status);
        }
        tokio::time::sleep(self.delay).await;

        if let Some(n) = self.running.lock().unwrap().get_mut(&key) {
            *n -= 1;
        }

        let script = *self.script.lock().unwrap();
        match script {
            Script::Succeed => Ok(Artifact {
                bundle: json!({"key": key.to_string()}),
                analysis: json!({"summary": "ok"}),
            }),
            Script::Fail => Err(JobError::Generic("upstream exploded".into())),
            Script::Deny => Err(JobError::AccessDenied("404 Not Found".into())),
        }
    }
}

fn context(max_attempts: u32) -> JobsContext {
    JobsContext::in_memory(move |_| RetryPolicy {
        max_attempts,
        backoff_base: Duration::ZERO,
    })
    .unwrap()
}

fn dispatcher(ctx: &JobsContext) -> BatchDispatcher {
    BatchDispatcher::new(Arc::new(ctx.registry.clone()), ctx.status.clone())
}

fn worker(ctx: &JobsContext, id: &str, op: OperationKind, executor: Arc<dyn JobExecutor>) -> Worker {
    Worker::new(
        id.to_string(),
        ctx.registry.queue(op).clone(),
        executor,
        ctx.status.clone(),
        ctx.results.clone(),
        WorkerSettings {
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            job_timeout: None,
        },
    )
}

async fn status_of(ctx: &JobsContext, key: &EntityKey, op: OperationKind) -> Option<ProcessingStatusRecord> {
    ctx.status.get_status(key, op).await.unwrap()
}

/// Process jobs until the channel has nothing runnable.
async fn drain(w: &Worker) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = w.run_once().await.unwrap() {
        outcomes.push(outcome);
    }
    outcomes
}

// =============================================================================
// Dispatch
// =============================================================================

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn test_hidden_repository_is_not_dispatched() {
        let ctx = context(3);
        let x = EntityKey::new("a", "x");
        let y = EntityKey::new("a", "y");
        ctx.hidden.set(&y, true).await.unwrap();
        let hidden = ctx.hidden.snapshot().await.unwrap();

        let outcome = dispatcher(&ctx)
            .dispatch_batch(
                OperationKind::Analyze,
                vec![Candidate::new(x.clone(), false), Candidate::new(y.clone(), false)],
                &hidden,
                DispatchFilter {
                    exclude_hidden: true,
                    forks: ForkMode::Include,
                },
                None,
            )
            .await;

        assert_eq!(outcome.summary(), BatchDispatchSummary { queued: 1, failed: 0 });
        let queue = ctx.registry.queue(OperationKind::Analyze);
        let waiting = queue.list_jobs(JobState::Waiting, 0, 10).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].payload.key(), &x);

        assert_eq!(
            status_of(&ctx, &x, OperationKind::Analyze).await.unwrap().status,
            ProcessingStatus::Pending
        );
        assert!(status_of(&ctx, &y, OperationKind::Analyze).await.is_none());
    }

    #[tokio::test]
    async fn test_queued_plus_failed_covers_every_filtered_candidate() {
        let ctx = context(3);
        let candidates: Vec<Candidate> = (0..6)
            .map(|i| Candidate::new(EntityKey::new("a", &format!("r{}", i)), i % 2 == 0))
            .collect();
        let filter = DispatchFilter {
            exclude_hidden: true,
            forks: ForkMode::Exclude,
        };
        let expected = filter.apply(candidates.clone(), &HashSet::new()).len();

        let summary = dispatcher(&ctx)
            .dispatch_batch(OperationKind::Sync, candidates, &HashSet::new(), filter, None)
            .await
            .summary();
        assert_eq!(summary.queued + summary.failed, expected);
        assert_eq!(
            ctx.registry.queue(OperationKind::Sync).counts().await.unwrap().waiting,
            expected as u64
        );
    }

    #[tokio::test]
    async fn test_empty_candidate_set_enqueues_nothing() {
        let ctx = context(3);
        let outcome = dispatcher(&ctx)
            .dispatch_batch(
                OperationKind::Readme,
                Vec::new(),
                &HashSet::new(),
                DispatchFilter::default(),
                None,
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::NothingToDo);
        assert_eq!(outcome.summary(), BatchDispatchSummary::default());
        assert_eq!(
            ctx.registry.queue(OperationKind::Readme).counts().await.unwrap().total(),
            0
        );
    }

    #[tokio::test]
    async fn test_enqueue_on_closed_queue_counts_as_failed() {
        let ctx = context(3);
        ctx.registry.close();
        let key = EntityKey::new("a", "x");
        let summary = dispatcher(&ctx)
            .dispatch_batch(
                OperationKind::Analyze,
                vec![Candidate::new(key.clone(), false)],
                &HashSet::new(),
                DispatchFilter::default(),
                None,
            )
            .await
            .summary();
        assert_eq!(summary, BatchDispatchSummary { queued: 0, failed: 1 });

        let record = status_of(&ctx, &key, OperationKind::Analyze).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.error_message.unwrap().contains("unavailable"));
    }
}

// =============================================================================
// Worker lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_completion() {
        let ctx = context(3);
        let key = EntityKey::new("a", "x");
        let executor = ScriptedExecutor::new(&ctx, Script::Succeed, Duration::ZERO);
        dispatcher(&ctx)
            .dispatch_one(JobPayload::for_operation(OperationKind::Readme, key.clone(), None))
            .await
            .unwrap();

        let w = worker(&ctx, "w1", OperationKind::Readme, executor.clone());
        assert_eq!(drain(&w).await, vec![JobOutcome::Completed]);

        assert_eq!(*executor.observed.lock().unwrap(), vec![ProcessingStatus::Processing]);
        let record = status_of(&ctx, &key, OperationKind::Readme).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        let cached = ctx.results.get(&key, OperationKind::Readme).await.unwrap().unwrap();
        assert_eq!(cached.payload.analysis["summary"], "ok");
    }

    #[tokio::test]
    async fn test_always_failing_job_is_attempted_max_attempts_times() {
        let ctx = context(3);
        let key = EntityKey::new("a", "x");
        let executor = ScriptedExecutor::new(&ctx, Script::Fail, Duration::ZERO);
        let id = dispatcher(&ctx)
            .dispatch_one(JobPayload::for_operation(OperationKind::Analyze, key.clone(), None))
            .await
            .unwrap();

        let w = worker(&ctx, "w1", OperationKind::Analyze, executor.clone());
        assert_eq!(
            drain(&w).await,
            vec![JobOutcome::Retrying, JobOutcome::Retrying, JobOutcome::Failed]
        );
        assert_eq!(executor.calls(), 3);

        let job = ctx.registry.queue(OperationKind::Analyze).get_job(&id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.failure_reason.as_deref(), Some("upstream exploded"));

        let record = status_of(&ctx, &key, OperationKind::Analyze).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("upstream exploded"));
    }

    #[tokio::test]
    async fn test_access_denied_completes_without_retry() {
        let ctx = context(3);
        let key = EntityKey::new("a", "private");
        let executor = ScriptedExecutor::new(&ctx, Script::Deny, Duration::ZERO);
        let id = dispatcher(&ctx)
            .dispatch_one(JobPayload::for_operation(OperationKind::Sync, key.clone(), None))
            .await
            .unwrap();

        let w = worker(&ctx, "w1", OperationKind::Sync, executor.clone());
        assert_eq!(drain(&w).await, vec![JobOutcome::Skipped]);
        assert_eq!(executor.calls(), 1);

        let job = ctx.registry.queue(OperationKind::Sync).get_job(&id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value.unwrap()["skipped"], true);
        assert_eq!(
            status_of(&ctx, &key, OperationKind::Sync).await.unwrap().status,
            ProcessingStatus::Completed
        );
        assert!(ctx.results.get(&key, OperationKind::Sync).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_retry_after_failure() {
        let ctx = context(1);
        let key = EntityKey::new("a", "x");
        let executor = ScriptedExecutor::new(&ctx, Script::Fail, Duration::ZERO);
        let id = dispatcher(&ctx)
            .dispatch_one(JobPayload::for_operation(OperationKind::Analyze, key.clone(), None))
            .await
            .unwrap();
        let w = worker(&ctx, "w1", OperationKind::Analyze, executor.clone());
        assert_eq!(drain(&w).await, vec![JobOutcome::Failed]);

        admin::apply_action(&ctx.registry, "analyze", &id, JobAction::Retry)
            .await
            .unwrap();
        let job = ctx.registry.queue(OperationKind::Analyze).get_job(&id).await.unwrap();
        assert_eq!(job.state, JobState::Waiting);
        let record = status_of(&ctx, &key, OperationKind::Analyze).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Pending);
        assert!(record.error_message.is_none());

        executor.set_script(Script::Succeed);
        assert_eq!(drain(&w).await, vec![JobOutcome::Completed]);
        assert_eq!(
            executor.observed.lock().unwrap().last(),
            Some(&ProcessingStatus::Processing)
        );
        // Completed after failed("...") leaves no stale message behind.
        let record = status_of(&ctx, &key, OperationKind::Analyze).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert!(record.error_message.is_none());
    }
}

// =============================================================================
// Concurrency and recovery
// =============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_same_key_runs_one_job_at_a_time() {
        let ctx = context(3);
        let key = EntityKey::new("a", "x");
        let executor = ScriptedExecutor::new(&ctx, Script::Succeed, Duration::from_millis(50));
        let queue = ctx.registry.queue(OperationKind::Analyze);
        for _ in 0..2 {
            queue
                .enqueue(JobPayload::for_operation(OperationKind::Analyze, key.clone(), None))
                .await
                .unwrap();
        }

        let w1 = worker(&ctx, "w1", OperationKind::Analyze, executor.clone());
        let w2 = worker(&ctx, "w2", OperationKind::Analyze, executor.clone());
        let (a, b) = tokio::join!(w1.run_once(), w2.run_once());
        let ran = [a.unwrap(), b.unwrap()].iter().filter(|o| o.is_some()).count();
        assert_eq!(ran, 1);

        assert_eq!(drain(&w2).await, vec![JobOutcome::Completed]);
        assert_eq!(executor.max_concurrent_per_key.load(Ordering::SeqCst), 1);
        assert_eq!(queue.counts().await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let ctx = context(3);
        let executor = ScriptedExecutor::new(&ctx, Script::Succeed, Duration::from_millis(50));
        let queue = ctx.registry.queue(OperationKind::Analyze);
        for name in ["x", "y"] {
            queue
                .enqueue(JobPayload::for_operation(
                    OperationKind::Analyze,
                    EntityKey::new("a", name),
                    None,
                ))
                .await
                .unwrap();
        }

        let w1 = worker(&ctx, "w1", OperationKind::Analyze, executor.clone());
        let w2 = worker(&ctx, "w2", OperationKind::Analyze, executor.clone());
        let (a, b) = tokio::join!(w1.run_once(), w2.run_once());
        assert_eq!(a.unwrap(), Some(JobOutcome::Completed));
        assert_eq!(b.unwrap(), Some(JobOutcome::Completed));
    }

    #[tokio::test]
    async fn test_abandoned_job_is_reclaimed_and_status_returns_to_pending() {
        let ctx = context(3);
        let key = EntityKey::new("a", "x");
        let id = dispatcher(&ctx)
            .dispatch_one(JobPayload::for_operation(OperationKind::Screenshot, key.clone(), None))
            .await
            .unwrap();

        // A worker claims the job and then disappears without a heartbeat.
        let queue = ctx.registry.queue(OperationKind::Screenshot);
        let claimed = queue.claim("ghost", Duration::from_millis(20)).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        ctx.status
            .set_status(&key, OperationKind::Screenshot, ProcessingStatus::Processing, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let reaper = Reaper::new(ctx.registry.clone(), ctx.status.clone(), Duration::from_millis(10));
        assert_eq!(reaper.sweep().await, 1);
        assert_eq!(
            status_of(&ctx, &key, OperationKind::Screenshot).await.unwrap().status,
            ProcessingStatus::Pending
        );
        let job = queue.get_job(&id).await.unwrap();
        assert_ne!(job.state, JobState::Active);
        assert_eq!(job.failure_reason.as_deref(), Some("lease expired"));

        // The ghost's late completion is ignored; a live worker finishes the job.
        assert!(!queue.complete(&id, "ghost", json!({})).await.unwrap());
        let executor = ScriptedExecutor::new(&ctx, Script::Succeed, Duration::ZERO);
        let w = worker(&ctx, "w1", OperationKind::Screenshot, executor);
        assert_eq!(drain(&w).await, vec![JobOutcome::Completed]);
        assert_eq!(
            status_of(&ctx, &key, OperationKind::Screenshot).await.unwrap().status,
            ProcessingStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_result_upsert_keeps_one_record_and_advances() {
        let ctx = context(3);
        let key = EntityKey::new("a", "x");
        let artifact = Artifact {
            bundle: json!({}),
            analysis: json!({"v": 1}),
        };
        let first = ctx
            .results
            .upsert(&key, OperationKind::Analyze, artifact.clone())
            .await
            .unwrap();
        let second = ctx
            .results
            .upsert(&key, OperationKind::Analyze, artifact)
            .await
            .unwrap();
        assert!(second.updated_at > first.updated_at);
        assert_eq!(ctx.results.list(Some(OperationKind::Analyze)).await.unwrap().len(), 1);
    }
}
