use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Entity identity ───────────────────────────────────────────────────

/// Case-insensitive `(namespace, name)` pair identifying a repository.
///
/// Both halves are trimmed and lowercased on construction, so `Octo/Repo`
/// and `octo/repo` address the same status record and cached result.
/// Serialized as the `namespace/name` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
    namespace: String,
    name: String,
}

impl EntityKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.trim().to_lowercase(),
            name: name.trim().to_lowercase(),
        }
    }

    /// Like [`EntityKey::new`], but rejects empty halves and halves that
    /// contain `/`, which would not survive a `namespace/name` round trip.
    pub fn try_new(namespace: &str, name: &str) -> Result<Self, String> {
        let key = Self::new(namespace, name);
        if key.is_well_formed() {
            Ok(key)
        } else {
            Err(format!(
                "Invalid entity key '{}/{}': expected owner/name",
                namespace, name
            ))
        }
    }

    pub fn is_well_formed(&self) -> bool {
        let valid = |half: &str| !half.is_empty() && !half.contains('/');
        valid(&self.namespace) && valid(&self.name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| format!("Invalid entity key '{}': expected owner/name", s))?;
        Self::try_new(namespace, name)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.to_string()
    }
}

// ── Operations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Analyze,
    ShortDescription,
    Readme,
    Screenshot,
    Sync,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        Self::Analyze,
        Self::ShortDescription,
        Self::Readme,
        Self::Screenshot,
        Self::Sync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::ShortDescription => "short-description",
            Self::Readme => "readme",
            Self::Screenshot => "screenshot",
            Self::Sync => "sync",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(Self::Analyze),
            "short-description" | "short_description" => Ok(Self::ShortDescription),
            "readme" => Ok(Self::Readme),
            "screenshot" => Ok(Self::Screenshot),
            "sync" => Ok(Self::Sync),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

// ── Processing status ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid processing status: {}", s)),
        }
    }
}

/// Current lifecycle state of one (entity, operation) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatusRecord {
    pub key: EntityKey,
    pub operation: OperationKind,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ── Result cache ──────────────────────────────────────────────────────

/// The computed output of a job: what was fetched and what was derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub bundle: serde_json::Value,
    pub analysis: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub key: EntityKey,
    pub operation: OperationKind,
    pub payload: Artifact,
    pub updated_at: DateTime<Utc>,
}

// ── Jobs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Waiting,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Delayed,
        Self::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Per-job credentials may only name environment variables under this prefix.
pub const CREDENTIAL_ENV_PREFIX: &str = "REPOWATCH_TOKEN_";

/// Accept `REPOWATCH_TOKEN_<NAME>`, with NAME made of uppercase ASCII letters,
/// digits and underscores.
pub fn check_credential_ref(credential_ref: &str) -> Result<(), String> {
    let valid = credential_ref
        .strip_prefix(CREDENTIAL_ENV_PREFIX)
        .is_some_and(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(format!(
            "Invalid credential reference '{}': expected {}<NAME>",
            credential_ref, CREDENTIAL_ENV_PREFIX
        ))
    }
}

/// Typed job payload, one variant per [`OperationKind`].
///
/// `credential_ref` names a credential (for the GitHub collaborator, a
/// `REPOWATCH_TOKEN_*` environment variable holding a token); the secret
/// itself never enters the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum JobPayload {
    Analyze {
        key: EntityKey,
        #[serde(default)]
        credential_ref: Option<String>,
        /// Recompute even when the cached artifact was built from the same bundle.
        #[serde(default)]
        force: bool,
    },
    ShortDescription {
        key: EntityKey,
        #[serde(default)]
        credential_ref: Option<String>,
    },
    Readme {
        key: EntityKey,
        #[serde(default)]
        credential_ref: Option<String>,
    },
    Screenshot {
        key: EntityKey,
        #[serde(default)]
        credential_ref: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
    Sync {
        key: EntityKey,
        #[serde(default)]
        credential_ref: Option<String>,
    },
}

impl JobPayload {
    /// Build the default payload for `operation` targeting `key`.
    pub fn for_operation(
        operation: OperationKind,
        key: EntityKey,
        credential_ref: Option<String>,
    ) -> Self {
        match operation {
            OperationKind::Analyze => Self::Analyze {
                key,
                credential_ref,
                force: false,
            },
            OperationKind::ShortDescription => Self::ShortDescription { key, credential_ref },
            OperationKind::Readme => Self::Readme { key, credential_ref },
            OperationKind::Screenshot => Self::Screenshot {
                key,
                credential_ref,
                url: None,
            },
            OperationKind::Sync => Self::Sync { key, credential_ref },
        }
    }

    /// Apply the per-operation options. `force` only affects analyze and
    /// `url` only affects screenshot.
    pub fn with_options(mut self, force: bool, url: Option<String>) -> Self {
        match &mut self {
            Self::Analyze { force: f, .. } => *f = force,
            Self::Screenshot { url: u, .. } => *u = url,
            _ => {}
        }
        self
    }

    pub fn operation(&self) -> OperationKind {
        match self {
            Self::Analyze { .. } => OperationKind::Analyze,
            Self::ShortDescription { .. } => OperationKind::ShortDescription,
            Self::Readme { .. } => OperationKind::Readme,
            Self::Screenshot { .. } => OperationKind::Screenshot,
            Self::Sync { .. } => OperationKind::Sync,
        }
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Analyze { key, .. }
            | Self::ShortDescription { key, .. }
            | Self::Readme { key, .. }
            | Self::Screenshot { key, .. }
            | Self::Sync { key, .. } => key,
        }
    }

    pub fn credential_ref(&self) -> Option<&str> {
        match self {
            Self::Analyze { credential_ref, .. }
            | Self::ShortDescription { credential_ref, .. }
            | Self::Readme { credential_ref, .. }
            | Self::Screenshot { credential_ref, .. }
            | Self::Sync { credential_ref, .. } => credential_ref.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub channel: String,
    pub payload: JobPayload,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Per-state job totals for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Delayed => self.delayed += n,
            JobState::Paused => self.paused += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }
}

/// Automatic retry policy applied when a job body fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Exponential delay before the next attempt: `base * 2^(attempt - 1)`.
///
/// `attempt` is the number of attempts already made (1 after the first
/// failure). The exponent is capped so the delay cannot overflow.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

// ── Dispatch ──────────────────────────────────────────────────────────

/// A repository offered to the dispatcher by a candidate source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub key: EntityKey,
    #[serde(default)]
    pub fork: bool,
}

impl Candidate {
    pub fn new(key: EntityKey, fork: bool) -> Self {
        Self { key, fork }
    }
}

/// Enqueue attempts that were accepted vs. rejected synchronously.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDispatchSummary {
    pub queued: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_normalizes_case_and_whitespace() {
        let key = EntityKey::new(" Octo ", "Hello-World");
        assert_eq!(key.namespace(), "octo");
        assert_eq!(key.name(), "hello-world");
        assert_eq!(key, EntityKey::new("OCTO", "hello-world"));
        assert_eq!(key.to_string(), "octo/hello-world");
    }

    #[test]
    fn test_entity_key_parse_rejects_malformed() {
        assert_eq!("A/B".parse::<EntityKey>().unwrap(), EntityKey::new("a", "b"));
        assert!("no-slash".parse::<EntityKey>().is_err());
        assert!("/name".parse::<EntityKey>().is_err());
        assert!("owner/".parse::<EntityKey>().is_err());
        assert!("a/b/c".parse::<EntityKey>().is_err());
    }

    #[test]
    fn test_entity_key_try_new_rejects_slash_in_either_half() {
        assert_eq!(EntityKey::try_new(" A ", "B").unwrap(), EntityKey::new("a", "b"));
        assert!(EntityKey::try_new("a/b", "c").is_err());
        assert!(EntityKey::try_new("a", "b/c").is_err());
        assert!(EntityKey::try_new("  ", "c").is_err());
        assert!(EntityKey::try_new("a", "").is_err());
        assert!(!EntityKey::new("a/b", "c").is_well_formed());
        assert!(EntityKey::new("a", "c").is_well_formed());
    }

    #[test]
    fn test_entity_key_serializes_as_string() {
        let key = EntityKey::new("Octo", "Cat");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"octo/cat\"");
        let back: EntityKey = serde_json::from_str("\"OCTO/Cat\"").unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<EntityKey>("\"broken\"").is_err());
    }

    #[test]
    fn test_operation_kind_roundtrip() {
        for op in OperationKind::ALL {
            assert_eq!(OperationKind::from_str(op.as_str()).unwrap(), op);
        }
        assert!(OperationKind::from_str("bogus").is_err());
    }

    #[test]
    fn test_job_state_roundtrip() {
        for state in JobState::ALL {
            assert_eq!(JobState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(JobState::from_str("running").is_err());
    }

    #[test]
    fn test_credential_ref_must_use_token_prefix() {
        assert!(check_credential_ref("REPOWATCH_TOKEN_ACME").is_ok());
        assert!(check_credential_ref("REPOWATCH_TOKEN_TEAM_2").is_ok());
        assert!(check_credential_ref("REPOWATCH_TOKEN_").is_err());
        assert!(check_credential_ref("AWS_SECRET_ACCESS_KEY").is_err());
        assert!(check_credential_ref("GITHUB_TOKEN").is_err());
        assert!(check_credential_ref("REPOWATCH_TOKEN_acme").is_err());
        assert!(check_credential_ref("REPOWATCH_TOKEN_A=B").is_err());
    }

    #[test]
    fn test_payload_is_tagged_by_operation() {
        let payload = JobPayload::for_operation(
            OperationKind::ShortDescription,
            EntityKey::new("a", "x"),
            Some("TOKEN_A".into()),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["operation"], "short-description");
        assert_eq!(json["key"], "a/x");
        assert_eq!(json["credential_ref"], "TOKEN_A");

        let parsed: JobPayload =
            serde_json::from_value(serde_json::json!({"operation": "analyze", "key": "A/X"}))
                .unwrap();
        assert_eq!(parsed.operation(), OperationKind::Analyze);
        assert_eq!(parsed.key(), &EntityKey::new("a", "x"));
        assert!(matches!(parsed, JobPayload::Analyze { force: false, .. }));
        assert_eq!(parsed.credential_ref(), None);
    }

    #[test]
    fn test_payload_options_apply_per_operation() {
        let key = EntityKey::new("a", "x");
        let analyze = JobPayload::for_operation(OperationKind::Analyze, key.clone(), None)
            .with_options(true, Some("https://x.dev".into()));
        assert!(matches!(analyze, JobPayload::Analyze { force: true, .. }));

        let shot = JobPayload::for_operation(OperationKind::Screenshot, key.clone(), None)
            .with_options(true, Some("https://x.dev".into()));
        assert!(matches!(shot, JobPayload::Screenshot { url: Some(ref u), .. } if u == "https://x.dev"));

        let sync = JobPayload::for_operation(OperationKind::Sync, key.clone(), None)
            .with_options(true, None);
        assert_eq!(sync, JobPayload::for_operation(OperationKind::Sync, key, None));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(2000, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2000, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(2000, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(0, 5), Duration::ZERO);
        // Huge attempt counts saturate instead of overflowing.
        assert!(backoff_delay(u64::MAX, 64) >= Duration::from_millis(u64::MAX / 2));
    }

    #[test]
    fn test_job_counts_total() {
        let mut counts = JobCounts::default();
        counts.add(JobState::Waiting, 2);
        counts.add(JobState::Failed, 1);
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
    }
}
