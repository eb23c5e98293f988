use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::db::DbHandle;
use super::models::*;
use super::queue::JobSink;
use super::status::StatusTracker;
use crate::errors::QueueError;

/// How forked repositories are treated by a batch dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkMode {
    #[default]
    Include,
    Exclude,
    Only,
}

impl ForkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Include => "include",
            Self::Exclude => "exclude",
            Self::Only => "only",
        }
    }

    fn admits(&self, fork: bool) -> bool {
        match self {
            Self::Include => true,
            Self::Exclude => !fork,
            Self::Only => fork,
        }
    }
}

impl fmt::Display for ForkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ForkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            "only" => Ok(Self::Only),
            _ => Err(format!("Invalid fork mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchFilter {
    pub exclude_hidden: bool,
    pub forks: ForkMode,
}

impl DispatchFilter {
    /// Hidden-set exclusion first, then the fork filter. Candidate order is
    /// preserved.
    pub fn apply(&self, candidates: Vec<Candidate>, hidden: &HashSet<EntityKey>) -> Vec<Candidate> {
        candidates
            .into_iter()
            .filter(|c| !(self.exclude_hidden && hidden.contains(&c.key)))
            .filter(|c| self.forks.admits(c.fork))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The filtered set was empty; nothing was enqueued.
    NothingToDo,
    Dispatched(BatchDispatchSummary),
}

impl DispatchOutcome {
    pub fn summary(&self) -> BatchDispatchSummary {
        match self {
            Self::NothingToDo => BatchDispatchSummary::default(),
            Self::Dispatched(summary) => *summary,
        }
    }
}

/// Repositories the operator has hidden from batch runs.
#[derive(Clone)]
pub struct HiddenSet {
    db: DbHandle,
}

impl HiddenSet {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Returns whether the set changed.
    pub async fn set(&self, key: &EntityKey, hidden: bool) -> Result<bool> {
        let key = key.clone();
        self.db
            .call(move |db| db.set_hidden(&key, hidden, Utc::now()))
            .await
    }

    pub async fn list(&self) -> Result<Vec<EntityKey>> {
        self.db.call(|db| db.list_hidden()).await
    }

    pub async fn snapshot(&self) -> Result<HashSet<EntityKey>> {
        Ok(self.list().await?.into_iter().collect())
    }
}

/// Fans a batch request out into one single-entity job per candidate.
#[derive(Clone)]
pub struct BatchDispatcher {
    sink: Arc<dyn JobSink>,
    status: StatusTracker,
}

impl BatchDispatcher {
    pub fn new(sink: Arc<dyn JobSink>, status: StatusTracker) -> Self {
        Self { sink, status }
    }

    /// Filter `candidates`, mark each survivor pending and enqueue it. All
    /// enqueues run concurrently; a rejected enqueue is counted, never fatal.
    pub async fn dispatch_batch(
        &self,
        operation: OperationKind,
        candidates: Vec<Candidate>,
        hidden: &HashSet<EntityKey>,
        filter: DispatchFilter,
        credential_ref: Option<&str>,
    ) -> DispatchOutcome {
        let survivors = filter.apply(candidates, hidden);
        if survivors.is_empty() {
            info!(operation = %operation, "batch dispatch: nothing to do");
            return DispatchOutcome::NothingToDo;
        }

        let results = futures::future::join_all(survivors.into_iter().map(|c| {
            let payload =
                JobPayload::for_operation(operation, c.key, credential_ref.map(str::to_string));
            self.dispatch_one(payload)
        }))
        .await;

        let queued = results.iter().filter(|r| r.is_ok()).count();
        let summary = BatchDispatchSummary {
            queued,
            failed: results.len() - queued,
        };
        info!(
            operation = %operation,
            queued = summary.queued,
            failed = summary.failed,
            "batch dispatched"
        );
        DispatchOutcome::Dispatched(summary)
    }

    /// Mark the payload's entity pending and enqueue it. On rejection the
    /// status is set to failed with the queue's message. A malformed key is
    /// refused before any status is written.
    pub async fn dispatch_one(&self, payload: JobPayload) -> Result<String, QueueError> {
        let key = payload.key().clone();
        let operation = payload.operation();
        if !key.is_well_formed() {
            return Err(QueueError::InvalidKey(key.to_string()));
        }
        self.status
            .set_status(&key, operation, ProcessingStatus::Pending, None)
            .await
            .map_err(QueueError::unavailable)?;

        match self.sink.enqueue(payload).await {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!(key = %key, operation = %operation, error = %e, "enqueue rejected");
                let message = e.to_string();
                if let Err(status_err) = self
                    .status
                    .set_status(&key, operation, ProcessingStatus::Failed, Some(&message))
                    .await
                {
                    warn!(key = %key, error = %status_err, "failed to record enqueue failure");
                }
                Err(e)
            }
        }
    }
}
