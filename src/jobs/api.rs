use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::admin::{self, JobAction};
use super::context::JobsContext;
use super::dispatcher::{BatchDispatcher, DispatchFilter, DispatchOutcome, ForkMode};
use super::executor::CandidateSource;
use super::models::*;
use crate::errors::{JobError, QueueError};

const DEFAULT_JOB_LIMIT: usize = 20;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub ctx: JobsContext,
    pub dispatcher: BatchDispatcher,
    /// Required for batch dispatch; single-repo dispatch works without it.
    pub candidates: Option<Arc<dyn CandidateSource>>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct QueueStatusQuery {
    pub queue: Option<String>,
    /// Comma-separated job states.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionRequest {
    pub action: String,
    pub queue_name: String,
    pub job_id: String,
}

#[derive(Deserialize)]
pub struct RepoQuery {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub operation: Option<String>,
    /// Comma-separated processing statuses; only used when listing everything.
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct SetHiddenRequest {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_true")]
    pub hidden: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDispatchRequest {
    pub owner: String,
    #[serde(default = "default_true")]
    pub exclude_hidden: bool,
    #[serde(default)]
    pub forks: ForkMode,
    pub credential_ref: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleDispatchRequest {
    pub owner: String,
    pub repo: String,
    pub credential_ref: Option<String>,
    #[serde(default)]
    pub force: bool,
    pub url: Option<String>,
}

fn default_true() -> bool {
    true
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let msg = err.to_string();
        match err {
            QueueError::Unavailable(_) => ApiError::ServiceUnavailable(msg),
            QueueError::UnknownQueue(_) | QueueError::JobNotFound { .. } => ApiError::NotFound(msg),
            QueueError::InvalidState { .. } => ApiError::Conflict(msg),
            QueueError::InvalidPayload { .. } | QueueError::InvalidKey(_) => {
                ApiError::BadRequest(msg)
            }
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let msg = err.to_string();
        match err {
            JobError::AccessDenied(_) => ApiError::NotFound(msg),
            JobError::RateLimited(_) => ApiError::ServiceUnavailable(msg),
            JobError::Generic(_) => ApiError::Internal(msg),
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", err))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/queues/status", get(queue_status))
        .route("/api/queues/jobs", post(job_action))
        .route("/api/repos/status", get(repo_status))
        .route("/api/repos/results", get(repo_results))
        .route("/api/repos/hidden", get(list_hidden).post(set_hidden))
        .route("/api/dispatch/{operation}", post(dispatch_single))
        .route("/api/dispatch/{operation}/batch", post(dispatch_batch))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_operation(s: &str) -> Result<OperationKind, ApiError> {
    OperationKind::from_str(s).map_err(ApiError::BadRequest)
}

fn parse_key(owner: &str, repo: &str) -> Result<EntityKey, ApiError> {
    EntityKey::try_new(owner, repo).map_err(ApiError::BadRequest)
}

fn parse_credential_ref(credential_ref: Option<String>) -> Result<Option<String>, ApiError> {
    if let Some(var) = &credential_ref {
        check_credential_ref(var).map_err(ApiError::BadRequest)?;
    }
    Ok(credential_ref)
}

fn parse_processing_statuses(list: &str) -> Result<Vec<ProcessingStatus>, ApiError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ProcessingStatus::from_str)
        .collect::<Result<_, _>>()
        .map_err(ApiError::BadRequest)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn queue_status(
    State(state): State<SharedState>,
    Query(query): Query<QueueStatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let states = match query.status.as_deref() {
        Some(list) => admin::parse_states(list).map_err(ApiError::BadRequest)?,
        None => Vec::new(),
    };
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT);
    let queues =
        admin::queue_overview(&state.ctx.registry, query.queue.as_deref(), &states, limit).await?;
    Ok(Json(json!({ "queues": queues })))
}

async fn job_action(
    State(state): State<SharedState>,
    Json(req): Json<JobActionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = JobAction::from_str(&req.action).map_err(ApiError::BadRequest)?;
    let message = admin::apply_action(
        &state.ctx.registry,
        &req.queue_name,
        &req.job_id,
        action,
    )
    .await?;
    Ok(Json(json!({ "message": message })))
}

/// All records, the records for one repository, or a single record.
async fn repo_status(
    State(state): State<SharedState>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let operation = query.operation.as_deref().map(parse_operation).transpose()?;
    match (query.owner.as_deref(), query.repo.as_deref()) {
        (Some(owner), Some(repo)) => {
            let key = parse_key(owner, repo)?;
            let value = match operation {
                Some(op) => {
                    let record = state.ctx.status.get_status(&key, op).await.map_err(internal)?;
                    json!(record)
                }
                None => {
                    let records = state
                        .ctx
                        .status
                        .get_statuses_for_key(&key)
                        .await
                        .map_err(internal)?;
                    if records.is_empty() {
                        serde_json::Value::Null
                    } else {
                        json!(records)
                    }
                }
            };
            Ok(Json(value))
        }
        (None, None) => {
            let statuses = match query.status.as_deref() {
                Some(list) => parse_processing_statuses(list)?,
                None => Vec::new(),
            };
            let records = state
                .ctx
                .status
                .get_statuses(operation, &statuses)
                .await
                .map_err(internal)?;
            Ok(Json(json!(records)))
        }
        _ => Err(ApiError::BadRequest(
            "owner and repo must be given together".into(),
        )),
    }
}

async fn repo_results(
    State(state): State<SharedState>,
    Query(query): Query<RepoQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (Some(owner), Some(repo), Some(operation)) = (
        query.owner.as_deref(),
        query.repo.as_deref(),
        query.operation.as_deref(),
    ) else {
        return Err(ApiError::BadRequest(
            "owner, repo and operation are required".into(),
        ));
    };
    let key = parse_key(owner, repo)?;
    let operation = parse_operation(operation)?;
    let record = state
        .ctx
        .results
        .get(&key, operation)
        .await
        .map_err(internal)?;
    Ok(Json(json!(record)))
}

async fn list_hidden(State(state): State<SharedState>) -> Result<Json<Vec<EntityKey>>, ApiError> {
    let keys = state.ctx.hidden.list().await.map_err(internal)?;
    Ok(Json(keys))
}

async fn set_hidden(
    State(state): State<SharedState>,
    Json(req): Json<SetHiddenRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = parse_key(&req.owner, &req.repo)?;
    let changed = state
        .ctx
        .hidden
        .set(&key, req.hidden)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "key": key, "hidden": req.hidden, "changed": changed })))
}

async fn dispatch_batch(
    State(state): State<SharedState>,
    Path(operation): Path<String>,
    Json(req): Json<BatchDispatchRequest>,
) -> Result<Response, ApiError> {
    let operation = parse_operation(&operation)?;
    let source = state.candidates.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("No candidate source configured".into())
    })?;
    if req.owner.trim().is_empty() {
        return Err(ApiError::BadRequest("owner is required".into()));
    }
    let credential_ref = parse_credential_ref(req.credential_ref)?;

    let candidates = source
        .list_candidates(req.owner.trim(), credential_ref.as_deref())
        .await?;
    let hidden = state.ctx.hidden.snapshot().await.map_err(internal)?;
    let filter = DispatchFilter {
        exclude_hidden: req.exclude_hidden,
        forks: req.forks,
    };

    let outcome = state
        .dispatcher
        .dispatch_batch(
            operation,
            candidates,
            &hidden,
            filter,
            credential_ref.as_deref(),
        )
        .await;
    let response = match outcome {
        DispatchOutcome::NothingToDo => (
            StatusCode::OK,
            Json(json!({
                "message": format!("No repositories to {}", operation),
                "repoCount": 0,
                "queued": 0,
                "failed": 0,
            })),
        ),
        DispatchOutcome::Dispatched(summary) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": format!("Queued {} {} job(s)", summary.queued, operation),
                "repoCount": summary.queued + summary.failed,
                "queued": summary.queued,
                "failed": summary.failed,
            })),
        ),
    };
    Ok(response.into_response())
}

async fn dispatch_single(
    State(state): State<SharedState>,
    Path(operation): Path<String>,
    Json(req): Json<SingleDispatchRequest>,
) -> Result<Response, ApiError> {
    let operation = parse_operation(&operation)?;
    let key = parse_key(&req.owner, &req.repo)?;
    let credential_ref = parse_credential_ref(req.credential_ref)?;
    let payload = JobPayload::for_operation(operation, key, credential_ref)
        .with_options(req.force, req.url);
    let job_key = payload.key().clone();
    let job_id = state.dispatcher.dispatch_one(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": format!("Queued {} for {}", operation, job_key),
            "jobId": job_id,
            "repoCount": 1,
        })),
    )
        .into_response())
}
