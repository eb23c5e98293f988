use std::path::Path;

use anyhow::{Context, Result};

use super::db::{DbHandle, JobsDb};
use super::dispatcher::HiddenSet;
use super::models::{OperationKind, RetryPolicy};
use super::queue::QueueRegistry;
use super::results::ResultCache;
use super::status::StatusTracker;

/// The stores and queues shared by every component, opened once at startup
/// and passed explicitly to the dispatcher, the workers and the HTTP state.
#[derive(Clone)]
pub struct JobsContext {
    pub db: DbHandle,
    pub registry: QueueRegistry,
    pub status: StatusTracker,
    pub results: ResultCache,
    pub hidden: HiddenSet,
}

impl JobsContext {
    pub fn new(
        db: DbHandle,
        namespace: u32,
        policy_for: impl Fn(OperationKind) -> RetryPolicy,
    ) -> Self {
        Self {
            registry: QueueRegistry::new(db.clone(), namespace, policy_for),
            status: StatusTracker::new(db.clone()),
            results: ResultCache::new(db.clone()),
            hidden: HiddenSet::new(db.clone()),
            db,
        }
    }

    /// Open (or create) the database file, creating its parent directory.
    pub fn open(
        path: &Path,
        namespace: u32,
        policy_for: impl Fn(OperationKind) -> RetryPolicy,
    ) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = JobsDb::new(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self::new(DbHandle::new(db), namespace, policy_for))
    }

    pub fn in_memory(policy_for: impl Fn(OperationKind) -> RetryPolicy) -> Result<Self> {
        Ok(Self::new(DbHandle::new(JobsDb::new_in_memory()?), 0, policy_for))
    }
}
