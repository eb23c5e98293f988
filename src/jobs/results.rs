use anyhow::Result;
use chrono::Utc;

use super::db::DbHandle;
use super::models::{Artifact, EntityKey, OperationKind, ResultRecord};

/// Last computed artifact per (entity, operation). Written only by workers
/// after a successful run.
#[derive(Clone)]
pub struct ResultCache {
    db: DbHandle,
}

impl ResultCache {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        key: &EntityKey,
        operation: OperationKind,
        artifact: Artifact,
    ) -> Result<ResultRecord> {
        let key = key.clone();
        self.db
            .call(move |db| db.upsert_result(&key, operation, &artifact, Utc::now()))
            .await
    }

    pub async fn get(&self, key: &EntityKey, operation: OperationKind) -> Result<Option<ResultRecord>> {
        let key = key.clone();
        self.db.call(move |db| db.get_result(&key, operation)).await
    }

    pub async fn list(&self, operation: Option<OperationKind>) -> Result<Vec<ResultRecord>> {
        self.db.call(move |db| db.list_results(operation)).await
    }
}
