use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use super::db::{DbHandle, JobsDb, NewJob, after};
use super::models::*;
use crate::errors::QueueError;

/// One durable channel of work for a single [`OperationKind`].
///
/// Cloning is cheap; clones share the database handle, the wake-up
/// notification and the closed flag.
#[derive(Clone)]
pub struct JobQueue {
    channel: String,
    operation: OperationKind,
    db: DbHandle,
    policy: RetryPolicy,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(channel: String, operation: OperationKind, db: DbHandle, policy: RetryPolicy) -> Self {
        Self {
            channel,
            operation,
            db,
            policy,
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new jobs and wake every idle worker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until a job is enqueued or `poll` elapses, whichever comes first.
    pub async fn wait_for_work(&self, poll: Duration) {
        let _ = tokio::time::timeout(poll, self.notify.notified()).await;
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<Job, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Unavailable(format!(
                "queue '{}' is closed",
                self.channel
            )));
        }
        if payload.operation() != self.operation {
            return Err(QueueError::InvalidPayload {
                channel: self.channel.clone(),
                operation: payload.operation().to_string(),
            });
        }
        if !payload.key().is_well_formed() {
            return Err(QueueError::InvalidKey(payload.key().to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let channel = self.channel.clone();
        let policy = self.policy;
        let job = self
            .db
            .call(move |db| {
                db.insert_job(
                    &NewJob {
                        id: &id,
                        channel: &channel,
                        payload: &payload,
                        max_attempts: policy.max_attempts,
                        backoff_ms: policy.backoff_base.as_millis() as u64,
                    },
                    Utc::now(),
                )
            })
            .await
            .map_err(QueueError::unavailable)?;

        debug!(channel = %self.channel, job_id = %job.id, key = %job.payload.key(), "job enqueued");
        self.notify.notify_one();
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, QueueError> {
        let channel = self.channel.clone();
        let lookup = id.to_string();
        let job = self
            .db
            .call(move |db| db.get_job(&channel, &lookup))
            .await
            .map_err(QueueError::unavailable)?;
        job.ok_or_else(|| QueueError::JobNotFound {
            channel: self.channel.clone(),
            id: id.to_string(),
        })
    }

    pub async fn list_jobs(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let channel = self.channel.clone();
        self.db
            .call(move |db| db.list_jobs(&channel, state, offset, limit))
            .await
            .map_err(QueueError::unavailable)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let channel = self.channel.clone();
        self.db
            .call(move |db| db.count_jobs(&channel))
            .await
            .map_err(QueueError::unavailable)
    }

    /// waiting | delayed → paused.
    pub async fn pause(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, "pause", |db, id, _| db.pause_job(id)).await
    }

    /// paused → waiting, or delayed while its backoff is still pending.
    pub async fn resume(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, "resume", |db, id, now| db.resume_job(id, now))
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    /// failed → waiting with a fresh attempt budget.
    pub async fn retry(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, "retry", |db, id, now| db.retry_job(id, now))
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Permanently delete a job that is not active.
    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, "remove", |db, id, _| db.remove_job(id)).await
    }

    /// Look up the job and apply `f` under one database lock. `f` returns
    /// false when the job's state does not admit the action.
    async fn transition<F>(&self, id: &str, action: &'static str, f: F) -> Result<(), QueueError>
    where
        F: FnOnce(&JobsDb, &str, DateTime<Utc>) -> anyhow::Result<bool> + Send + 'static,
    {
        let channel = self.channel.clone();
        let id = id.to_string();
        self.db
            .call(move |db| {
                let Some(job) = db.get_job(&channel, &id)? else {
                    return Ok(Err(QueueError::JobNotFound { channel, id }));
                };
                if f(db, &id, Utc::now())? {
                    Ok(Ok(()))
                } else {
                    Ok(Err(QueueError::InvalidState {
                        id,
                        action,
                        state: job.state,
                    }))
                }
            })
            .await
            .map_err(QueueError::unavailable)?
    }

    // ── Worker-facing operations ─────────────────────────────────────

    /// Claim the next runnable job under a lease of `lease` for `worker_id`.
    /// A closed queue hands out nothing.
    pub async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, QueueError> {
        if self.is_closed() {
            return Ok(None);
        }
        let channel = self.channel.clone();
        let worker_id = worker_id.to_string();
        self.db
            .call(move |db| {
                let now = Utc::now();
                db.claim_job(&channel, &worker_id, now, after(now, lease))
            })
            .await
            .map_err(QueueError::unavailable)
    }

    /// Returns false when the lease was lost before completion was recorded.
    pub async fn complete(
        &self,
        id: &str,
        lease_owner: &str,
        return_value: serde_json::Value,
    ) -> Result<bool, QueueError> {
        let id = id.to_string();
        let owner = lease_owner.to_string();
        let job = self
            .db
            .call(move |db| db.complete_job(&id, &owner, &return_value, Utc::now()))
            .await
            .map_err(QueueError::unavailable)?;
        Ok(job.is_some())
    }

    /// Record a failed attempt and hand the job to the backoff policy.
    /// Returns `None` when `lease_owner` no longer holds the job.
    pub async fn fail(&self, id: &str, lease_owner: &str, reason: &str) -> Result<Option<Job>, QueueError> {
        let id = id.to_string();
        let owner = lease_owner.to_string();
        let reason = reason.to_string();
        self.db
            .call(move |db| db.fail_job(&id, &owner, &reason, Utc::now()))
            .await
            .map_err(QueueError::unavailable)
    }

    pub async fn renew_lease(&self, id: &str, lease_owner: &str, lease: Duration) -> Result<bool, QueueError> {
        let id = id.to_string();
        let owner = lease_owner.to_string();
        self.db
            .call(move |db| db.renew_lease(&id, &owner, after(Utc::now(), lease)))
            .await
            .map_err(QueueError::unavailable)
    }

    /// Reclaim active jobs whose lease has run out. Returns them in their new
    /// state (delayed or failed).
    pub async fn reclaim_expired(&self) -> Result<Vec<Job>, QueueError> {
        let channel = self.channel.clone();
        let reclaimed = self
            .db
            .call(move |db| db.reclaim_expired(&channel, Utc::now()))
            .await
            .map_err(QueueError::unavailable)?;
        if !reclaimed.is_empty() {
            self.notify.notify_one();
        }
        Ok(reclaimed)
    }
}

/// Channel name for `operation` in logical database `namespace`.
pub fn channel_name(namespace: u32, operation: OperationKind) -> String {
    if namespace == 0 {
        operation.as_str().to_string()
    } else {
        format!("{}:{}", namespace, operation.as_str())
    }
}

/// Every channel, built once at startup and handed to the dispatcher, the
/// workers and the HTTP state.
#[derive(Clone)]
pub struct QueueRegistry {
    // Indexed by `OperationKind as usize`, in `OperationKind::ALL` order.
    queues: Arc<Vec<JobQueue>>,
}

impl QueueRegistry {
    pub fn new(db: DbHandle, namespace: u32, policy_for: impl Fn(OperationKind) -> RetryPolicy) -> Self {
        let queues = OperationKind::ALL
            .iter()
            .map(|&op| JobQueue::new(channel_name(namespace, op), op, db.clone(), policy_for(op)))
            .collect();
        Self {
            queues: Arc::new(queues),
        }
    }

    pub fn queue(&self, operation: OperationKind) -> &JobQueue {
        &self.queues[operation as usize]
    }

    /// Resolve a queue by channel name or operation name.
    pub fn by_name(&self, name: &str) -> Result<&JobQueue, QueueError> {
        let name = name.trim();
        self.queues
            .iter()
            .find(|q| q.channel() == name || q.operation().as_str() == name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &JobQueue> {
        self.queues.iter()
    }

    pub fn close(&self) {
        for queue in self.queues.iter() {
            queue.close();
        }
    }
}

/// Where the dispatcher sends new work.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Enqueue `payload` on its operation's channel and return the job id.
    async fn enqueue(&self, payload: JobPayload) -> Result<String, QueueError>;
}

#[async_trait]
impl JobSink for QueueRegistry {
    async fn enqueue(&self, payload: JobPayload) -> Result<String, QueueError> {
        let job = self.queue(payload.operation()).enqueue(payload).await?;
        Ok(job.id)
    }
}
