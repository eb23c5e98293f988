use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use super::db::DbHandle;
use super::models::{EntityKey, OperationKind, ProcessingStatus, ProcessingStatusRecord};

/// Durable per-(entity, operation) lifecycle records.
///
/// Every write is an unconditional overwrite; the last writer wins.
#[derive(Clone)]
pub struct StatusTracker {
    db: DbHandle,
}

impl StatusTracker {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Overwrite the status of `(key, operation)`. `error_message` is only
    /// kept for [`ProcessingStatus::Failed`].
    pub async fn set_status(
        &self,
        key: &EntityKey,
        operation: OperationKind,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<ProcessingStatusRecord> {
        let key = key.clone();
        let message = match status {
            ProcessingStatus::Failed => error_message.map(str::to_string),
            _ => None,
        };
        let record = self
            .db
            .call(move |db| db.upsert_status(&key, operation, status, message.as_deref(), Utc::now()))
            .await?;
        debug!(key = %record.key, operation = %operation, status = status.as_str(), "status updated");
        Ok(record)
    }

    pub async fn get_status(
        &self,
        key: &EntityKey,
        operation: OperationKind,
    ) -> Result<Option<ProcessingStatusRecord>> {
        let key = key.clone();
        self.db.call(move |db| db.get_status(&key, operation)).await
    }

    /// Every operation's record for `key`.
    pub async fn get_statuses_for_key(&self, key: &EntityKey) -> Result<Vec<ProcessingStatusRecord>> {
        let key = key.clone();
        self.db.call(move |db| db.get_statuses_for_key(&key)).await
    }

    pub async fn get_statuses(
        &self,
        operation: Option<OperationKind>,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<ProcessingStatusRecord>> {
        let statuses = statuses.to_vec();
        self.db
            .call(move |db| db.list_statuses(operation, &statuses))
            .await
    }
}
