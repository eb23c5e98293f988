use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::context::JobsContext;
use super::executor::JobExecutor;
use super::models::*;
use super::queue::{JobQueue, QueueRegistry};
use super::results::ResultCache;
use super::status::StatusTracker;
use crate::errors::{JobError, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// How long a claim stays valid without a heartbeat.
    pub lease: Duration,
    /// Idle wait between claims when no enqueue notification arrives.
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            job_timeout: None,
        }
    }
}

impl WorkerSettings {
    fn heartbeat(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(10))
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Access denied: completed without a result and never retried.
    Skipped,
    /// Failed; the queue scheduled another attempt.
    Retrying,
    /// Failed with no attempts left.
    Failed,
    /// The lease expired before the outcome could be recorded.
    LeaseLost,
}

/// A single executor bound to one channel.
#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: JobQueue,
    executor: Arc<dyn JobExecutor>,
    status: StatusTracker,
    results: ResultCache,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        id: String,
        queue: JobQueue,
        executor: Arc<dyn JobExecutor>,
        status: StatusTracker,
        results: ResultCache,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            queue,
            executor,
            status,
            results,
            settings,
        }
    }

    /// Claim and process at most one job. `Ok(None)` means nothing was runnable.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim(&self.id, self.settings.lease).await? else {
            return Ok(None);
        };
        let span = info_span!(
            "job",
            worker = %self.id,
            job_id = %job.id,
            channel = %job.channel,
            key = %job.payload.key(),
            attempt = job.attempts_made,
        );
        self.process_job(job).instrument(span).await.map(Some)
    }

    /// Run the body of an already-claimed job and record its outcome in the
    /// status store, the result cache and the queue.
    pub async fn process_job(&self, job: Job) -> Result<JobOutcome, QueueError> {
        let key = job.payload.key().clone();
        let operation = job.payload.operation();
        debug!("job started");
        self.set_status(&key, operation, ProcessingStatus::Processing, None)
            .await;

        let artifact = match self.execute_with_heartbeat(&job).await {
            Ok(artifact) => artifact,
            Err(e) if !e.is_retryable() => {
                let reason = e.to_string();
                if !self.still_leased(&job).await? {
                    return Ok(JobOutcome::LeaseLost);
                }
                info!(reason = %reason, "not retryable, skipping");
                self.set_status(&key, operation, ProcessingStatus::Completed, None)
                    .await;
                let recorded = self
                    .queue
                    .complete(&job.id, &self.id, json!({"skipped": true, "reason": reason}))
                    .await?;
                return Ok(if recorded {
                    JobOutcome::Skipped
                } else {
                    JobOutcome::LeaseLost
                });
            }
            Err(e) => return self.record_failure(&job, &key, operation, e).await,
        };

        // A reclaimed job belongs to whoever claims it next; its outcome must
        // not overwrite theirs.
        if !self.still_leased(&job).await? {
            return Ok(JobOutcome::LeaseLost);
        }
        if let Err(e) = self.results.upsert(&key, operation, artifact).await {
            return self
                .record_failure(&job, &key, operation, JobError::from(e))
                .await;
        }
        self.set_status(&key, operation, ProcessingStatus::Completed, None)
            .await;
        let recorded = self
            .queue
            .complete(&job.id, &self.id, json!({"skipped": false}))
            .await?;
        if recorded {
            info!("job completed");
            Ok(JobOutcome::Completed)
        } else {
            warn!("lease lost before completion was recorded");
            Ok(JobOutcome::LeaseLost)
        }
    }

    /// Renew the lease once more before writing an outcome. False when the
    /// job was reclaimed while the body ran.
    async fn still_leased(&self, job: &Job) -> Result<bool, QueueError> {
        let held = self
            .queue
            .renew_lease(&job.id, &self.id, self.settings.lease)
            .await?;
        if !held {
            warn!("lease lost, discarding outcome");
        }
        Ok(held)
    }

    async fn record_failure(
        &self,
        job: &Job,
        key: &EntityKey,
        operation: OperationKind,
        err: JobError,
    ) -> Result<JobOutcome, QueueError> {
        if !self.still_leased(job).await? {
            return Ok(JobOutcome::LeaseLost);
        }
        let message = err.to_string();
        self.set_status(key, operation, ProcessingStatus::Failed, Some(&message))
            .await;
        let outcome = match self.queue.fail(&job.id, &self.id, &message).await? {
            Some(failed) if failed.state == JobState::Delayed => JobOutcome::Retrying,
            Some(_) => JobOutcome::Failed,
            None => JobOutcome::LeaseLost,
        };
        warn!(error = %message, outcome = ?outcome, "job failed");
        Ok(outcome)
    }

    /// Status writes are best-effort: a failed write is logged and the job
    /// carries on, since the queue remains the source of truth for progress.
    async fn set_status(
        &self,
        key: &EntityKey,
        operation: OperationKind,
        status: ProcessingStatus,
        message: Option<&str>,
    ) {
        if let Err(e) = self.status.set_status(key, operation, status, message).await {
            warn!(error = %e, status = status.as_str(), "failed to write status");
        }
    }

    /// Execute the job body while renewing the lease in the background.
    async fn execute_with_heartbeat(&self, job: &Job) -> Result<Artifact, JobError> {
        let body = async {
            match self.settings.job_timeout {
                Some(limit) => tokio::time::timeout(limit, self.executor.execute(&job.payload))
                    .await
                    .unwrap_or_else(|_| {
                        Err(JobError::Generic(format!(
                            "Job timed out after {}s",
                            limit.as_secs_f64()
                        )))
                    }),
                None => self.executor.execute(&job.payload).await,
            }
        };

        let heartbeat = async {
            let mut ticker = tokio::time::interval(self.settings.heartbeat());
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self
                    .queue
                    .renew_lease(&job.id, &self.id, self.settings.lease)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("lease lost, letting the body finish");
                        std::future::pending::<()>().await;
                    }
                    Err(e) => warn!(error = %e, "lease renewal failed"),
                }
            }
        };

        tokio::select! {
            result = body => result,
            _ = heartbeat => Err(JobError::Generic("heartbeat stopped".into())),
        }
    }

    /// Claim and process jobs until `shutdown` flips to true. The job in
    /// flight when shutdown arrives is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, channel = %self.queue.channel(), "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(worker = %self.id, error = %e, "claim failed"),
            }
            tokio::select! {
                _ = self.queue.wait_for_work(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}

/// Periodically returns jobs with expired leases to the retry path.
#[derive(Clone)]
pub struct Reaper {
    registry: QueueRegistry,
    status: StatusTracker,
    interval: Duration,
}

impl Reaper {
    pub fn new(registry: QueueRegistry, status: StatusTracker, interval: Duration) -> Self {
        Self {
            registry,
            status,
            interval,
        }
    }

    /// One pass over every channel. Returns the number of reclaimed jobs.
    pub async fn sweep(&self) -> usize {
        let mut reclaimed = 0;
        for queue in self.registry.all() {
            let jobs = match queue.reclaim_expired().await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(channel = %queue.channel(), error = %e, "lease sweep failed");
                    continue;
                }
            };
            for job in jobs {
                let key = job.payload.key();
                let operation = job.payload.operation();
                let result = if job.state == JobState::Failed {
                    self.status
                        .set_status(key, operation, ProcessingStatus::Failed, Some("lease expired"))
                        .await
                } else {
                    self.status
                        .set_status(key, operation, ProcessingStatus::Pending, None)
                        .await
                };
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "failed to reset status of reclaimed job");
                }
                info!(channel = %queue.channel(), job_id = %job.id, state = %job.state, "reclaimed expired lease");
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// All workers for all channels plus the lease reaper.
pub struct WorkerPool {
    registry: QueueRegistry,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency(op)` workers for every channel.
    pub fn start(
        ctx: &JobsContext,
        executor: Arc<dyn JobExecutor>,
        concurrency: impl Fn(OperationKind) -> usize,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..8];
        let mut handles = Vec::new();

        for queue in ctx.registry.all() {
            let n = concurrency(queue.operation());
            for i in 0..n {
                let worker = Worker::new(
                    format!("{}:{}:{}", run_id, queue.channel(), i),
                    queue.clone(),
                    executor.clone(),
                    ctx.status.clone(),
                    ctx.results.clone(),
                    settings,
                );
                handles.push(tokio::spawn(worker.run(rx.clone())));
            }
        }

        let reaper = Reaper::new(ctx.registry.clone(), ctx.status.clone(), settings.heartbeat());
        handles.push(tokio::spawn(reaper.run(rx)));

        info!(workers = handles.len() - 1, "worker pool started");
        Self {
            registry: ctx.registry.clone(),
            shutdown,
            handles,
        }
    }

    /// Stop claiming, close the queues and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.registry.close();
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}
