use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::models::*;
use super::queue::QueueRegistry;
use crate::errors::QueueError;

/// Operator actions on a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pause,
    Resume,
    Retry,
    Remove,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::Remove => "remove",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            Self::Pause => "paused",
            Self::Resume => "resumed",
            Self::Retry => "queued for retry",
            Self::Remove => "removed",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "retry" => Ok(Self::Retry),
            "remove" => Ok(Self::Remove),
            _ => Err(format!("Invalid action: {}", s)),
        }
    }
}

/// Apply `action` to job `job_id` on `queue_name` and return a confirmation
/// message. A manual retry also resets the entity's status to pending.
pub async fn apply_action(
    registry: &QueueRegistry,
    queue_name: &str,
    job_id: &str,
    action: JobAction,
) -> Result<String, QueueError> {
    let queue = registry.by_name(queue_name)?;
    match action {
        JobAction::Pause => queue.pause(job_id).await?,
        JobAction::Resume => queue.resume(job_id).await?,
        JobAction::Retry => queue.retry(job_id).await?,
        JobAction::Remove => queue.remove(job_id).await?,
    }
    info!(channel = %queue.channel(), job_id = %job_id, action = %action, "admin action applied");
    Ok(format!("Job {} {}", job_id, action.past_tense()))
}

/// Counts and a page of jobs per state for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub counts: JobCounts,
    pub jobs: BTreeMap<String, Vec<Job>>,
}

/// Snapshot of `queue_name` (or every channel when `None`), listing up to
/// `limit` oldest jobs for each requested state (every state when empty).
pub async fn queue_overview(
    registry: &QueueRegistry,
    queue_name: Option<&str>,
    states: &[JobState],
    limit: usize,
) -> Result<BTreeMap<String, QueueSnapshot>, QueueError> {
    let queues = match queue_name {
        Some(name) => vec![registry.by_name(name)?],
        None => registry.all().collect(),
    };
    let states: Vec<JobState> = if states.is_empty() {
        JobState::ALL.to_vec()
    } else {
        states.to_vec()
    };

    let mut overview = BTreeMap::new();
    for queue in queues {
        let counts = queue.counts().await?;
        let mut jobs = BTreeMap::new();
        for state in &states {
            jobs.insert(state.to_string(), queue.list_jobs(*state, 0, limit).await?);
        }
        overview.insert(queue.channel().to_string(), QueueSnapshot { counts, jobs });
    }
    Ok(overview)
}

/// Parse a comma-separated list of job states, ignoring blanks.
pub fn parse_states(list: &str) -> Result<Vec<JobState>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(JobState::from_str)
        .collect()
}
