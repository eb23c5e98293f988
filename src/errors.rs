//! Typed error hierarchy for repowatch.
//!
//! Two enums cover the two failure domains:
//! - `JobError`: failures raised while executing a job body, classified by
//!   how the worker must react (skip, retry with backoff)
//! - `QueueError`: failures of the job queue itself and of administrative
//!   control requests

use thiserror::Error;

use crate::jobs::models::JobState;

/// Errors raised by a job body or by the collaborators it calls.
#[derive(Debug, Error)]
pub enum JobError {
    /// The caller lacks permission for the entity. Terminal, never retried,
    /// recorded as a skipped completion.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Upstream throttling. Retried through the queue's backoff policy.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Any other execution failure. Retried through the queue's backoff policy.
    #[error("{0}")]
    Generic(String),
}

impl JobError {
    pub fn generic(err: impl std::fmt::Display) -> Self {
        Self::Generic(err.to_string())
    }

    /// Whether the queue should apply its automatic retry policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AccessDenied(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Generic(format!("{:#}", err))
    }
}

/// Errors from the job queue and its administrative surface.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached or the queue has been closed.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Job {id} not found in queue '{channel}'")]
    JobNotFound { channel: String, id: String },

    #[error("Cannot {action} job {id}: job is {state}")]
    InvalidState {
        id: String,
        action: &'static str,
        state: JobState,
    },

    #[error("Payload for '{operation}' cannot be enqueued on channel '{channel}'")]
    InvalidPayload { channel: String, operation: String },

    #[error("Invalid entity key '{0}': expected owner/name")]
    InvalidKey(String),
}

impl QueueError {
    pub(crate) fn unavailable(err: anyhow::Error) -> Self {
        Self::Unavailable(format!("{:#}", err))
    }
}
