//! Job bodies and the external collaborators they call.
//!
//! The worker only sees [`JobExecutor`]. The production executor,
//! [`CollaboratorExecutor`], fetches a [`RepoBundle`] from a [`RepoSource`]
//! and hands it to an [`Analyzer`]. Each seam is a trait so tests can swap in
//! fakes without network access.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{Artifact, Candidate, EntityKey, JobPayload};
use super::results::ResultCache;
use crate::errors::JobError;

/// Repository metadata and content fetched for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoBundle {
    pub key: EntityKey,
    pub description: Option<String>,
    pub default_branch: Option<String>,
    pub language: Option<String>,
    pub stars: u64,
    pub fork: bool,
    pub archived: bool,
    pub homepage: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub readme: Option<String>,
    pub pushed_at: Option<String>,
}

impl RepoBundle {
    /// A bundle with nothing but its key.
    pub fn empty(key: EntityKey) -> Self {
        Self {
            key,
            description: None,
            default_branch: None,
            language: None,
            stars: 0,
            fork: false,
            archived: false,
            homepage: None,
            topics: Vec::new(),
            readme: None,
            pushed_at: None,
        }
    }
}

#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Errors must be classified: permission problems as `AccessDenied`,
    /// throttling as `RateLimited`.
    async fn fetch_bundle(
        &self,
        key: &EntityKey,
        credential_ref: Option<&str>,
    ) -> Result<RepoBundle, JobError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn compute(
        &self,
        payload: &JobPayload,
        bundle: &RepoBundle,
    ) -> Result<serde_json::Value, JobError>;
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn list_candidates(
        &self,
        owner: &str,
        credential_ref: Option<&str>,
    ) -> Result<Vec<Candidate>, JobError>;
}

/// Runs the body of one job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, payload: &JobPayload) -> Result<Artifact, JobError>;
}

/// Fetch, then analyze. Analyze jobs without `force` reuse the cached
/// analysis when the freshly fetched bundle is identical to the cached one.
pub struct CollaboratorExecutor {
    source: Arc<dyn RepoSource>,
    analyzer: Arc<dyn Analyzer>,
    results: ResultCache,
}

impl CollaboratorExecutor {
    pub fn new(source: Arc<dyn RepoSource>, analyzer: Arc<dyn Analyzer>, results: ResultCache) -> Self {
        Self {
            source,
            analyzer,
            results,
        }
    }
}

#[async_trait]
impl JobExecutor for CollaboratorExecutor {
    async fn execute(&self, payload: &JobPayload) -> Result<Artifact, JobError> {
        let key = payload.key();
        let bundle = self
            .source
            .fetch_bundle(key, payload.credential_ref())
            .await?;
        let bundle_json = serde_json::to_value(&bundle).map_err(JobError::generic)?;

        if let JobPayload::Analyze { force: false, .. } = payload
            && let Some(cached) = self.results.get(key, payload.operation()).await?
            && cached.payload.bundle == bundle_json
        {
            debug!(key = %key, "bundle unchanged, reusing cached analysis");
            return Ok(Artifact {
                bundle: bundle_json,
                analysis: cached.payload.analysis,
            });
        }

        let analysis = self.analyzer.compute(payload, &bundle).await?;
        Ok(Artifact {
            bundle: bundle_json,
            analysis,
        })
    }
}
