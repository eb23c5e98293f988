//! Configuration for repowatch, read from `.repowatch/repowatch.toml`.
//!
//! Settings are layered file → environment → CLI. Every field has a default,
//! so a missing file or an empty one is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [queue]
//! path = ".repowatch/repowatch.db"
//! namespace = 0
//!
//! [defaults]
//! attempts = 3
//! backoff_ms = 2000
//! lease_secs = 300
//! poll_interval_ms = 500
//! job_timeout_secs = 0
//! concurrency = 2
//!
//! [channels.screenshot]
//! concurrency = 1
//! attempts = 2
//!
//! [github]
//! api_url = "https://api.github.com"
//! token_env = "GITHUB_TOKEN"
//!
//! [server]
//! port = 3142
//! ```
//!
//! Environment overrides: `REPOWATCH_DB_PATH`, `REPOWATCH_PORT`,
//! `REPOWATCH_ATTEMPTS`, `REPOWATCH_BACKOFF_MS`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::context::JobsContext;
use crate::jobs::models::{OperationKind, RetryPolicy};
use crate::jobs::worker::WorkerSettings;

pub const CONFIG_DIR: &str = ".repowatch";
pub const CONFIG_FILE: &str = "repowatch.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    /// SQLite file backing the queue, status and result stores. Relative
    /// paths resolve against the project directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Logical database index. Non-zero values prefix channel names.
    #[serde(default)]
    pub namespace: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("repowatch.db")
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            namespace: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 0 disables the per-job timeout.
    #[serde(default)]
    pub job_timeout_secs: u64,
    /// Workers per channel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_lease_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_concurrency() -> usize {
    2
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: 0,
            concurrency: default_concurrency(),
        }
    }
}

/// Per-channel overrides of `[defaults]`, keyed by operation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding the token used when a job names no
    /// credential of its own.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// The complete repowatch.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepowatchToml {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelOverride>,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub server: ServerSection,
}

impl RepowatchToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse repowatch.toml")
    }

    /// Load `repowatch.toml` from `config_dir`, or defaults when it is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize repowatch.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `REPOWATCH_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply `REPOWATCH_*` overrides using `lookup` to read variables.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("REPOWATCH_DB_PATH").filter(|p| !p.is_empty()) {
            self.queue.path = PathBuf::from(path);
        }
        if let Some(port) = lookup("REPOWATCH_PORT") {
            self.server.port = parse_env("REPOWATCH_PORT", &port)?;
        }
        if let Some(attempts) = lookup("REPOWATCH_ATTEMPTS") {
            self.defaults.attempts = parse_env("REPOWATCH_ATTEMPTS", &attempts)?;
        }
        if let Some(backoff) = lookup("REPOWATCH_BACKOFF_MS") {
            self.defaults.backoff_ms = parse_env("REPOWATCH_BACKOFF_MS", &backoff)?;
        }
        Ok(())
    }

    /// Reject settings that would leave a channel unable to run jobs.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.attempts == 0 {
            bail!("defaults.attempts must be at least 1");
        }
        if self.defaults.concurrency == 0 {
            bail!("defaults.concurrency must be at least 1");
        }
        if self.defaults.lease_secs == 0 {
            bail!("defaults.lease_secs must be at least 1");
        }
        if self.defaults.poll_interval_ms == 0 {
            bail!("defaults.poll_interval_ms must be at least 1");
        }
        for (name, channel) in &self.channels {
            OperationKind::from_str(name)
                .map_err(|_| anyhow::anyhow!("Unknown channel '{}' in [channels]", name))?;
            if channel.attempts == Some(0) {
                bail!("channels.{}.attempts must be at least 1", name);
            }
            if channel.concurrency == Some(0) {
                bail!("channels.{}.concurrency must be at least 1", name);
            }
        }
        Ok(())
    }

    fn channel(&self, operation: OperationKind) -> Option<&ChannelOverride> {
        self.channels
            .iter()
            .find(|(name, _)| OperationKind::from_str(name).ok() == Some(operation))
            .map(|(_, channel)| channel)
    }

    pub fn retry_policy(&self, operation: OperationKind) -> RetryPolicy {
        let channel = self.channel(operation);
        RetryPolicy {
            max_attempts: channel
                .and_then(|c| c.attempts)
                .unwrap_or(self.defaults.attempts),
            backoff_base: Duration::from_millis(
                channel
                    .and_then(|c| c.backoff_ms)
                    .unwrap_or(self.defaults.backoff_ms),
            ),
        }
    }

    pub fn concurrency(&self, operation: OperationKind) -> usize {
        self.channel(operation)
            .and_then(|c| c.concurrency)
            .unwrap_or(self.defaults.concurrency)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            lease: Duration::from_secs(self.defaults.lease_secs),
            poll_interval: Duration::from_millis(self.defaults.poll_interval_ms),
            job_timeout: (self.defaults.job_timeout_secs > 0)
                .then(|| Duration::from_secs(self.defaults.job_timeout_secs)),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", name, value))
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct RepowatchConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: RepowatchToml,
}

impl RepowatchConfig {
    /// Load the project's config file, apply environment overrides and
    /// validate the result.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = RepowatchToml::load_or_default(&config_dir)?;
        toml.apply_env()?;
        toml.validate().context("Invalid configuration")?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            config_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        if self.toml.queue.path.is_absolute() {
            self.toml.queue.path.clone()
        } else {
            self.project_dir.join(&self.toml.queue.path)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// Open the stores and channel registry this configuration points at.
    pub fn open_jobs(&self) -> Result<JobsContext> {
        JobsContext::open(&self.db_path(), self.toml.queue.namespace, |op| {
            self.toml.retry_policy(op)
        })
    }
}
