use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the repowatch database.
///
/// Wraps `JobsDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up the async workers or the admin request path.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobsDb>>,
}

impl DbHandle {
    pub fn new(db: JobsDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobsDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

}

/// Fixed-width RFC 3339 with microseconds, so stored timestamps sort lexically.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", s))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Insert parameters for a new job.
pub struct NewJob<'a> {
    pub id: &'a str,
    pub channel: &'a str,
    pub payload: &'a JobPayload,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

const JOB_COLUMNS: &str = "id, channel, payload, state, attempts_made, max_attempts, enqueued_at, available_at, \
     started_at, finished_at, failure_reason, return_value, lease_owner, lease_expires_at";

/// Oldest runnable job on a channel whose entity has no active job on the
/// same channel.
const CLAIM_SQL: &str = "
    SELECT j.id FROM jobs j
    WHERE j.channel = ?1
      AND (j.state = 'waiting' OR (j.state = 'delayed' AND j.available_at <= ?2))
      AND NOT EXISTS (
          SELECT 1 FROM jobs a
          WHERE a.channel = j.channel
            AND a.entity_key = j.entity_key
            AND a.state = 'active'
      )
    ORDER BY j.seq
    LIMIT 1";

pub struct JobsDb {
    conn: Connection,
}

impl JobsDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.run_migrations().context("Failed to run migrations")?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    channel TEXT NOT NULL,
                    entity_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'waiting',
                    attempts_made INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    backoff_ms INTEGER NOT NULL,
                    enqueued_at TEXT NOT NULL,
                    available_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT,
                    failure_reason TEXT,
                    return_value TEXT,
                    lease_owner TEXT,
                    lease_expires_at TEXT
                );

                CREATE TABLE IF NOT EXISTS processing_status (
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error_message TEXT,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, name, operation)
                );

                CREATE TABLE IF NOT EXISTS result_cache (
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, name, operation)
                );

                CREATE TABLE IF NOT EXISTS hidden_entities (
                    namespace TEXT NOT NULL,
                    name TEXT NOT NULL,
                    hidden_at TEXT NOT NULL,
                    PRIMARY KEY (namespace, name)
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(channel, state, seq);
                CREATE INDEX IF NOT EXISTS idx_jobs_entity ON jobs(channel, entity_key, state);
                CREATE INDEX IF NOT EXISTS idx_status_operation ON processing_status(operation, status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, new: &NewJob<'_>, now: DateTime<Utc>) -> Result<Job> {
        let payload = serde_json::to_string(new.payload).context("Failed to encode job payload")?;
        let now = fmt_ts(now);
        self.conn
            .execute(
                "INSERT INTO jobs (id, channel, entity_key, payload, state, max_attempts, backoff_ms, enqueued_at, available_at)
                 VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?6, ?7, ?7)",
                params![
                    new.id,
                    new.channel,
                    new.payload.key().to_string(),
                    payload,
                    new.max_attempts as i64,
                    new.backoff_ms as i64,
                    now,
                ],
            )
            .context("Failed to insert job")?;
        self.get_job_by_id(new.id)?
            .context("Job not found after insert")
    }

    pub fn get_job_by_id(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        Ok(self.query_jobs(&sql, params![id])?.into_iter().next())
    }

    pub fn get_job(&self, channel: &str, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE channel = ?1 AND id = ?2", JOB_COLUMNS);
        Ok(self.query_jobs(&sql, params![channel, id])?.into_iter().next())
    }

    /// Jobs in `state`, oldest enqueued first.
    pub fn list_jobs(
        &self,
        channel: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE channel = ?1 AND state = ?2 ORDER BY seq LIMIT ?3 OFFSET ?4",
            JOB_COLUMNS
        );
        self.query_jobs(
            &sql,
            params![channel, state.as_str(), limit as i64, offset as i64],
        )
    }

    pub fn count_jobs(&self, channel: &str) -> Result<JobCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM jobs WHERE channel = ?1 GROUP BY state")
            .context("Failed to prepare count_jobs")?;
        let rows = stmt
            .query_map(params![channel], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to count jobs")?;
        let mut counts = JobCounts::default();
        for row in rows {
            let (state, n) = row.context("Failed to read job count row")?;
            let state = JobState::from_str(&state).map_err(|e| anyhow::anyhow!(e))?;
            counts.add(state, n as u64);
        }
        Ok(counts)
    }

    /// Atomically move the next runnable job on `channel` to `active` under a
    /// lease held by `worker_id`.
    pub fn claim_job(
        &self,
        channel: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let now = fmt_ts(now);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin claim transaction")?;
        let id: Option<String> = tx
            .query_row(CLAIM_SQL, params![channel, now], |row| row.get(0))
            .optional()
            .context("Failed to select job to claim")?;
        let Some(id) = id else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE jobs SET state = 'active', attempts_made = attempts_made + 1, started_at = ?1,
                 finished_at = NULL, lease_owner = ?2, lease_expires_at = ?3
             WHERE id = ?4",
            params![now, worker_id, fmt_ts(lease_until), id],
        )
        .context("Failed to mark job active")?;
        tx.commit().context("Failed to commit claim")?;
        self.get_job_by_id(&id)
    }

    /// Mark an active job completed. Returns `None` when `lease_owner` no
    /// longer holds the job (e.g. it was reclaimed after lease expiry).
    pub fn complete_job(
        &self,
        id: &str,
        lease_owner: &str,
        return_value: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'completed', finished_at = ?1, return_value = ?2,
                     failure_reason = NULL, lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?3 AND state = 'active' AND lease_owner = ?4",
                params![fmt_ts(now), return_value.to_string(), id, lease_owner],
            )
            .context("Failed to complete job")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_job_by_id(id)
    }

    /// Record a failed attempt. With `retry` set and attempts remaining the
    /// job moves to `delayed` with exponential backoff, otherwise to `failed`.
    pub fn fail_job(
        &self,
        id: &str,
        lease_owner: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row: Option<(i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT attempts_made, max_attempts, backoff_ms FROM jobs
                 WHERE id = ?1 AND state = 'active' AND lease_owner = ?2",
                params![id, lease_owner],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to load job for failure")?;
        let Some((attempts, max_attempts, backoff_ms)) = row else {
            return Ok(None);
        };
        self.retry_or_fail(id, attempts, max_attempts, backoff_ms, reason, now)?;
        self.get_job_by_id(id)
    }

    fn retry_or_fail(
        &self,
        id: &str,
        attempts: i64,
        max_attempts: i64,
        backoff_ms: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if attempts < max_attempts {
            let delay = backoff_delay(backoff_ms.max(0) as u64, attempts.max(0) as u32);
            self.conn
                .execute(
                    "UPDATE jobs SET state = 'delayed', available_at = ?1, failure_reason = ?2,
                         lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = ?3",
                    params![fmt_ts(after(now, delay)), reason, id],
                )
                .context("Failed to delay job for retry")?;
        } else {
            self.conn
                .execute(
                    "UPDATE jobs SET state = 'failed', finished_at = ?1, failure_reason = ?2,
                         lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = ?3",
                    params![fmt_ts(now), reason, id],
                )
                .context("Failed to mark job failed")?;
        }
        Ok(())
    }

    pub fn renew_lease(&self, id: &str, lease_owner: &str, until: DateTime<Utc>) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1
                 WHERE id = ?2 AND state = 'active' AND lease_owner = ?3",
                params![fmt_ts(until), id, lease_owner],
            )
            .context("Failed to renew lease")?;
        Ok(count > 0)
    }

    /// Return active jobs whose lease expired before `now` to the retry path.
    /// Each reclaimed job counts the abandoned run as a failed attempt.
    pub fn reclaim_expired(&self, channel: &str, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let expired: Vec<(String, i64, i64, i64)> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT id, attempts_made, max_attempts, backoff_ms FROM jobs
                     WHERE channel = ?1 AND state = 'active'
                       AND lease_expires_at IS NOT NULL AND lease_expires_at < ?2
                     ORDER BY seq",
                )
                .context("Failed to prepare reclaim_expired")?;
            let rows = stmt
                .query_map(params![channel, fmt_ts(now)], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .context("Failed to query expired leases")?;
            let mut expired = Vec::new();
            for row in rows {
                expired.push(row.context("Failed to read expired lease row")?);
            }
            expired
        };

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (id, attempts, max_attempts, backoff_ms) in expired {
            self.retry_or_fail(&id, attempts, max_attempts, backoff_ms, "lease expired", now)?;
            if let Some(job) = self.get_job_by_id(&id)? {
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    pub fn pause_job(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'paused' WHERE id = ?1 AND state IN ('waiting', 'delayed')",
                params![id],
            )
            .context("Failed to pause job")?;
        Ok(count > 0)
    }

    /// Paused jobs whose backoff has not elapsed go back to `delayed`.
    pub fn resume_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET state = CASE WHEN available_at > ?1 THEN 'delayed' ELSE 'waiting' END
                 WHERE id = ?2 AND state = 'paused'",
                params![fmt_ts(now), id],
            )
            .context("Failed to resume job")?;
        Ok(count > 0)
    }

    /// failed → waiting with a fresh attempt budget. The entity's status goes
    /// back to pending in the same transaction, so no worker can claim the
    /// job before that write lands.
    pub fn retry_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin retry transaction")?;
        let count = tx
            .execute(
                "UPDATE jobs SET state = 'waiting', attempts_made = 0, available_at = ?1,
                     started_at = NULL, finished_at = NULL, failure_reason = NULL, return_value = NULL
                 WHERE id = ?2 AND state = 'failed'",
                params![fmt_ts(now), id],
            )
            .context("Failed to retry job")?;
        if count == 0 {
            return Ok(false);
        }
        let job = self
            .get_job_by_id(id)?
            .context("Job not found after retry")?;
        self.upsert_status(
            job.payload.key(),
            job.payload.operation(),
            ProcessingStatus::Pending,
            None,
            now,
        )?;
        tx.commit().context("Failed to commit retry")?;
        Ok(true)
    }

    pub fn remove_job(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND state <> 'active'",
                params![id],
            )
            .context("Failed to remove job")?;
        Ok(count > 0)
    }

    fn query_jobs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare job query")?;
        let rows = stmt
            .query_map(params, JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    // ── Processing status ─────────────────────────────────────────────

    /// Unconditional overwrite of the (key, operation) status record.
    pub fn upsert_status(
        &self,
        key: &EntityKey,
        operation: OperationKind,
        status: ProcessingStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProcessingStatusRecord> {
        self.conn
            .execute(
                "INSERT INTO processing_status (namespace, name, operation, status, error_message, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(namespace, name, operation) DO UPDATE SET
                     status = excluded.status,
                     error_message = excluded.error_message,
                     updated_at = excluded.updated_at",
                params![
                    key.namespace(),
                    key.name(),
                    operation.as_str(),
                    status.as_str(),
                    error_message,
                    fmt_ts(now),
                ],
            )
            .context("Failed to upsert processing status")?;
        self.get_status(key, operation)?
            .context("Status record not found after upsert")
    }

    pub fn get_status(
        &self,
        key: &EntityKey,
        operation: OperationKind,
    ) -> Result<Option<ProcessingStatusRecord>> {
        let records = self.query_statuses(
            "SELECT namespace, name, operation, status, error_message, updated_at
             FROM processing_status WHERE namespace = ?1 AND name = ?2 AND operation = ?3",
            params![key.namespace(), key.name(), operation.as_str()],
        )?;
        Ok(records.into_iter().next())
    }

    pub fn get_statuses_for_key(&self, key: &EntityKey) -> Result<Vec<ProcessingStatusRecord>> {
        self.query_statuses(
            "SELECT namespace, name, operation, status, error_message, updated_at
             FROM processing_status WHERE namespace = ?1 AND name = ?2 ORDER BY operation",
            params![key.namespace(), key.name()],
        )
    }

    /// All status records, optionally narrowed to one operation and a set of
    /// statuses (an empty set means any status).
    pub fn list_statuses(
        &self,
        operation: Option<OperationKind>,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<ProcessingStatusRecord>> {
        let records = self.query_statuses(
            "SELECT namespace, name, operation, status, error_message, updated_at
             FROM processing_status WHERE (?1 IS NULL OR operation = ?1)
             ORDER BY namespace, name, operation",
            params![operation.map(|op| op.as_str())],
        )?;
        Ok(records
            .into_iter()
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .collect())
    }

    fn query_statuses<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ProcessingStatusRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare status query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(StatusRow {
                    namespace: row.get(0)?,
                    name: row.get(1)?,
                    operation: row.get(2)?,
                    status: row.get(3)?,
                    error_message: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .context("Failed to query statuses")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read status row")?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    // ── Result cache ──────────────────────────────────────────────────

    /// Idempotent per-key upsert. `updated_at` strictly advances even when two
    /// writes land in the same microsecond.
    pub fn upsert_result(
        &self,
        key: &EntityKey,
        operation: OperationKind,
        artifact: &Artifact,
        now: DateTime<Utc>,
    ) -> Result<ResultRecord> {
        let payload = serde_json::to_string(artifact).context("Failed to encode artifact")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin result transaction")?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT updated_at FROM result_cache WHERE namespace = ?1 AND name = ?2 AND operation = ?3",
                params![key.namespace(), key.name(), operation.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read previous result timestamp")?;

        let mut stamp = now.trunc_subsecs(6);
        if let Some(previous) = previous {
            let previous = parse_ts(&previous)?;
            if stamp <= previous {
                stamp = previous + chrono::Duration::microseconds(1);
            }
        }

        tx.execute(
            "INSERT INTO result_cache (namespace, name, operation, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(namespace, name, operation) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                key.namespace(),
                key.name(),
                operation.as_str(),
                payload,
                fmt_ts(stamp),
            ],
        )
        .context("Failed to upsert result")?;
        tx.commit().context("Failed to commit result upsert")?;
        self.get_result(key, operation)?
            .context("Result not found after upsert")
    }

    pub fn get_result(&self, key: &EntityKey, operation: OperationKind) -> Result<Option<ResultRecord>> {
        let records = self.query_results(
            "SELECT namespace, name, operation, payload, updated_at
             FROM result_cache WHERE namespace = ?1 AND name = ?2 AND operation = ?3",
            params![key.namespace(), key.name(), operation.as_str()],
        )?;
        Ok(records.into_iter().next())
    }

    pub fn list_results(&self, operation: Option<OperationKind>) -> Result<Vec<ResultRecord>> {
        self.query_results(
            "SELECT namespace, name, operation, payload, updated_at
             FROM result_cache WHERE (?1 IS NULL OR operation = ?1)
             ORDER BY namespace, name, operation",
            params![operation.map(|op| op.as_str())],
        )
    }

    fn query_results<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ResultRecord>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare result query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query results")?;
        let mut records = Vec::new();
        for row in rows {
            let (namespace, name, operation, payload, updated_at) =
                row.context("Failed to read result row")?;
            records.push(ResultRecord {
                key: EntityKey::new(&namespace, &name),
                operation: OperationKind::from_str(&operation).map_err(|e| anyhow::anyhow!(e))?,
                payload: serde_json::from_str(&payload).context("Failed to decode artifact")?,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(records)
    }

    // ── Hidden repositories ───────────────────────────────────────────

    /// Add or remove `key` from the hidden set. Returns whether anything changed.
    pub fn set_hidden(&self, key: &EntityKey, hidden: bool, now: DateTime<Utc>) -> Result<bool> {
        let count = if hidden {
            self.conn.execute(
                "INSERT OR IGNORE INTO hidden_entities (namespace, name, hidden_at) VALUES (?1, ?2, ?3)",
                params![key.namespace(), key.name(), fmt_ts(now)],
            )
        } else {
            self.conn.execute(
                "DELETE FROM hidden_entities WHERE namespace = ?1 AND name = ?2",
                params![key.namespace(), key.name()],
            )
        }
        .context("Failed to update hidden set")?;
        Ok(count > 0)
    }

    pub fn list_hidden(&self) -> Result<Vec<EntityKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT namespace, name FROM hidden_entities ORDER BY namespace, name")
            .context("Failed to prepare list_hidden")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EntityKey::new(
                    &row.get::<_, String>(0)?,
                    &row.get::<_, String>(1)?,
                ))
            })
            .context("Failed to query hidden set")?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read hidden row")?);
        }
        Ok(keys)
    }
}

// ── Row types ─────────────────────────────────────────────────────────

struct JobRow {
    id: String,
    channel: String,
    payload: String,
    state: String,
    attempts_made: i64,
    max_attempts: i64,
    enqueued_at: String,
    available_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    failure_reason: Option<String>,
    return_value: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempts_made: row.get(4)?,
            max_attempts: row.get(5)?,
            enqueued_at: row.get(6)?,
            available_at: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
            failure_reason: row.get(10)?,
            return_value: row.get(11)?,
            lease_owner: row.get(12)?,
            lease_expires_at: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .with_context(|| format!("Failed to decode payload of job {}", self.id))?;
        let state = JobState::from_str(&self.state).map_err(|e| anyhow::anyhow!(e))?;
        let return_value = self
            .return_value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to decode job return value")?;
        Ok(Job {
            id: self.id,
            channel: self.channel,
            payload,
            attempts_made: self.attempts_made.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            state,
            enqueued_at: parse_ts(&self.enqueued_at)?,
            available_at: parse_ts(&self.available_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            failure_reason: self.failure_reason,
            return_value,
            lease_owner: self.lease_owner,
            lease_expires_at: parse_opt_ts(self.lease_expires_at)?,
        })
    }
}

struct StatusRow {
    namespace: String,
    name: String,
    operation: String,
    status: String,
    error_message: Option<String>,
    updated_at: String,
}

impl StatusRow {
    fn into_record(self) -> Result<ProcessingStatusRecord> {
        Ok(ProcessingStatusRecord {
            key: EntityKey::new(&self.namespace, &self.name),
            operation: OperationKind::from_str(&self.operation).map_err(|e| anyhow::anyhow!(e))?,
            status: ProcessingStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            error_message: self.error_message,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn analyze(owner: &str, name: &str) -> JobPayload {
        JobPayload::for_operation(OperationKind::Analyze, EntityKey::new(owner, name), None)
    }

    fn insert(db: &JobsDb, id: &str, payload: &JobPayload, max_attempts: u32, now: DateTime<Utc>) -> Job {
        db.insert_job(
            &NewJob {
                id,
                channel: "analyze",
                payload,
                max_attempts,
                backoff_ms: 2000,
            },
            now,
        )
        .unwrap()
    }

    #[test]
    fn test_insert_and_get_job() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        let job = insert(&db, "j1", &analyze("A", "X"), 3, t0());
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.enqueued_at, t0());
        assert_eq!(job.payload.key(), &EntityKey::new("a", "x"));

        assert!(db.get_job("analyze", "j1")?.is_some());
        assert!(db.get_job("readme", "j1")?.is_none());
        assert!(db.get_job("analyze", "missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_jobs_oldest_first_with_limit_and_offset() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            insert(&db, &format!("j{}", i), &analyze("o", name), 3, t0());
        }
        let page = db.list_jobs("analyze", JobState::Waiting, 0, 2)?;
        let ids: Vec<&str> = page.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["j0", "j1"]);

        let page = db.list_jobs("analyze", JobState::Waiting, 2, 10)?;
        let ids: Vec<&str> = page.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["j2", "j3"]);

        assert!(db.list_jobs("analyze", JobState::Failed, 0, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_claim_takes_oldest_waiting_and_leases_it() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "first", &analyze("o", "a"), 3, t0());
        insert(&db, "second", &analyze("o", "b"), 3, t0());

        let claimed = db
            .claim_job("analyze", "w1", t0(), t0() + secs(300))?
            .expect("a job should be claimable");
        assert_eq!(claimed.id, "first");
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
        assert_eq!(claimed.lease_expires_at, Some(t0() + secs(300)));
        assert_eq!(claimed.started_at, Some(t0()));

        let next = db.claim_job("analyze", "w2", t0(), t0() + secs(300))?.unwrap();
        assert_eq!(next.id, "second");
        assert!(db.claim_job("analyze", "w3", t0(), t0() + secs(300))?.is_none());
        Ok(())
    }

    #[test]
    fn test_claim_is_single_flight_per_entity() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "batch", &analyze("o", "same"), 3, t0());
        insert(&db, "manual", &analyze("O", "Same"), 3, t0());
        insert(&db, "other", &analyze("o", "other"), 3, t0());

        let first = db.claim_job("analyze", "w1", t0(), t0() + secs(60))?.unwrap();
        assert_eq!(first.id, "batch");
        // "manual" targets the same entity, so the claim skips to "other".
        let second = db.claim_job("analyze", "w2", t0(), t0() + secs(60))?.unwrap();
        assert_eq!(second.id, "other");
        assert!(db.claim_job("analyze", "w3", t0(), t0() + secs(60))?.is_none());

        db.complete_job("batch", "w1", &serde_json::json!({"skipped": false}), t0())?;
        let third = db.claim_job("analyze", "w3", t0(), t0() + secs(60))?.unwrap();
        assert_eq!(third.id, "manual");
        Ok(())
    }

    #[test]
    fn test_complete_requires_lease_owner() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());
        db.claim_job("analyze", "w1", t0(), t0() + secs(60))?;

        let value = serde_json::json!({"skipped": true});
        assert!(db.complete_job("j1", "intruder", &value, t0())?.is_none());

        let done = db.complete_job("j1", "w1", &value, t0() + secs(5))?.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.return_value, Some(value));
        assert_eq!(done.finished_at, Some(t0() + secs(5)));
        assert!(done.lease_owner.is_none());
        Ok(())
    }

    #[test]
    fn test_fail_backs_off_exponentially_then_fails() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());

        // Attempt 1 fails: delayed by 2s.
        db.claim_job("analyze", "w", t0(), t0() + secs(60))?;
        let job = db.fail_job("j1", "w", "boom", t0())?.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.available_at, t0() + secs(2));
        assert_eq!(job.failure_reason.as_deref(), Some("boom"));

        // Not claimable before the delay elapses.
        assert!(db.claim_job("analyze", "w", t0() + secs(1), t0() + secs(60))?.is_none());

        // Attempt 2 fails: delayed by 4s.
        let now = t0() + secs(2);
        db.claim_job("analyze", "w", now, now + secs(60))?.unwrap();
        let job = db.fail_job("j1", "w", "boom", now)?.unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.available_at, now + secs(4));

        // Attempt 3 fails: attempts exhausted.
        let now = now + secs(4);
        let claimed = db.claim_job("analyze", "w", now, now + secs(60))?.unwrap();
        assert_eq!(claimed.attempts_made, 3);
        let job = db.fail_job("j1", "w", "boom", now)?.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.finished_at, Some(now));
        Ok(())
    }

    #[test]
    fn test_reclaim_expired_leases() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "retryable", &analyze("o", "a"), 3, t0());
        insert(&db, "exhausted", &analyze("o", "b"), 1, t0());
        insert(&db, "healthy", &analyze("o", "c"), 3, t0());

        db.claim_job("analyze", "w1", t0(), t0() + secs(10))?;
        db.claim_job("analyze", "w2", t0(), t0() + secs(10))?;
        db.claim_job("analyze", "w3", t0(), t0() + secs(10))?;
        assert!(db.renew_lease("healthy", "w3", t0() + secs(100))?);
        assert!(!db.renew_lease("healthy", "w1", t0() + secs(100))?);

        let reclaimed = db.reclaim_expired("analyze", t0() + secs(20))?;
        assert_eq!(reclaimed.len(), 2);
        assert_eq!(reclaimed[0].id, "retryable");
        assert_eq!(reclaimed[0].state, JobState::Delayed);
        assert_eq!(reclaimed[0].failure_reason.as_deref(), Some("lease expired"));
        assert_eq!(reclaimed[1].id, "exhausted");
        assert_eq!(reclaimed[1].state, JobState::Failed);

        let healthy = db.get_job_by_id("healthy")?.unwrap();
        assert_eq!(healthy.state, JobState::Active);

        // The original worker finishing late no longer owns the job.
        assert!(db.complete_job("retryable", "w1", &serde_json::json!({}), t0() + secs(21))?.is_none());
        Ok(())
    }

    #[test]
    fn test_pause_resume_only_touch_waiting_jobs() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());
        insert(&db, "j2", &analyze("o", "b"), 3, t0());

        assert!(db.pause_job("j1")?);
        assert!(!db.pause_job("j1")?, "already paused");
        // Paused jobs are skipped by claim.
        let claimed = db.claim_job("analyze", "w", t0(), t0() + secs(60))?.unwrap();
        assert_eq!(claimed.id, "j2");
        assert!(!db.pause_job("j2")?, "active jobs cannot be paused");

        assert!(db.resume_job("j1", t0())?);
        assert_eq!(db.get_job_by_id("j1")?.unwrap().state, JobState::Waiting);
        assert!(!db.resume_job("j1", t0())?, "not paused anymore");
        Ok(())
    }

    #[test]
    fn test_resume_keeps_pending_backoff() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());
        db.claim_job("analyze", "w", t0(), t0() + secs(60))?;
        db.fail_job("j1", "w", "boom", t0())?;
        assert!(db.pause_job("j1")?);

        assert!(db.resume_job("j1", t0() + secs(1))?);
        assert_eq!(db.get_job_by_id("j1")?.unwrap().state, JobState::Delayed);

        assert!(db.pause_job("j1")?);
        assert!(db.resume_job("j1", t0() + secs(10))?);
        assert_eq!(db.get_job_by_id("j1")?.unwrap().state, JobState::Waiting);
        Ok(())
    }

    #[test]
    fn test_retry_only_from_failed_and_resets_attempts() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 1, t0());
        assert!(!db.retry_job("j1", t0())?, "waiting jobs cannot be retried");

        db.claim_job("analyze", "w", t0(), t0() + secs(60))?;
        db.fail_job("j1", "w", "boom", t0())?;
        assert_eq!(db.get_job_by_id("j1")?.unwrap().state, JobState::Failed);

        let key = EntityKey::new("o", "a");
        db.upsert_status(&key, OperationKind::Analyze, ProcessingStatus::Failed, Some("boom"), t0())?;

        assert!(db.retry_job("j1", t0() + secs(30))?);
        let job = db.get_job_by_id("j1")?.unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.failure_reason.is_none());
        assert!(job.finished_at.is_none());
        let status = db.get_status(&key, OperationKind::Analyze)?.unwrap();
        assert_eq!(status.status, ProcessingStatus::Pending);
        assert!(status.error_message.is_none());
        Ok(())
    }

    #[test]
    fn test_remove_rejects_active_jobs() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());
        insert(&db, "j2", &analyze("o", "b"), 3, t0());
        db.claim_job("analyze", "w", t0(), t0() + secs(60))?;

        assert!(!db.remove_job("j1")?);
        assert!(db.remove_job("j2")?);
        assert!(db.get_job_by_id("j2")?.is_none());
        assert!(!db.remove_job("j2")?);
        Ok(())
    }

    #[test]
    fn test_count_jobs_by_state() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        insert(&db, "j1", &analyze("o", "a"), 3, t0());
        insert(&db, "j2", &analyze("o", "b"), 3, t0());
        insert(&db, "j3", &analyze("o", "c"), 3, t0());
        db.pause_job("j3")?;
        db.claim_job("analyze", "w", t0(), t0() + secs(60))?;

        let counts = db.count_jobs("analyze")?;
        assert_eq!(counts.active, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(db.count_jobs("readme")?, JobCounts::default());
        Ok(())
    }

    #[test]
    fn test_status_overwrite_clears_error_message() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        let key = EntityKey::new("a", "x");
        let failed = db.upsert_status(&key, OperationKind::Analyze, ProcessingStatus::Failed, Some("x"), t0())?;
        assert_eq!(failed.error_message.as_deref(), Some("x"));

        let done = db.upsert_status(&key, OperationKind::Analyze, ProcessingStatus::Completed, None, t0() + secs(1))?;
        assert_eq!(done.status, ProcessingStatus::Completed);
        assert!(done.error_message.is_none());
        assert_eq!(db.get_statuses_for_key(&key)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_status_is_per_operation() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        let key = EntityKey::new("a", "x");
        db.upsert_status(&key, OperationKind::Analyze, ProcessingStatus::Pending, None, t0())?;
        db.upsert_status(&key, OperationKind::Readme, ProcessingStatus::Failed, Some("no readme"), t0())?;
        db.upsert_status(&EntityKey::new("a", "y"), OperationKind::Readme, ProcessingStatus::Completed, None, t0())?;

        assert_eq!(db.get_statuses_for_key(&key)?.len(), 2);
        assert_eq!(db.list_statuses(None, &[])?.len(), 3);
        assert_eq!(db.list_statuses(Some(OperationKind::Readme), &[])?.len(), 2);
        let failed = db.list_statuses(None, &[ProcessingStatus::Failed])?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("no readme"));
        assert!(db.get_status(&EntityKey::new("a", "z"), OperationKind::Analyze)?.is_none());
        Ok(())
    }

    #[test]
    fn test_result_upsert_is_idempotent_and_advances_timestamp() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        let key = EntityKey::new("A", "X");
        let artifact = Artifact {
            bundle: serde_json::json!({"stars": 3}),
            analysis: serde_json::json!({"summary": "tiny"}),
        };

        let first = db.upsert_result(&key, OperationKind::Analyze, &artifact, t0())?;
        // Same payload written again at the same instant.
        let second = db.upsert_result(&key, OperationKind::Analyze, &artifact, t0())?;
        assert_eq!(second.payload, first.payload);
        assert!(second.updated_at > first.updated_at);

        let later = db.upsert_result(&key, OperationKind::Analyze, &artifact, t0() + secs(60))?;
        assert_eq!(later.updated_at, t0() + secs(60));

        let all = db.list_results(None)?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, EntityKey::new("a", "x"));
        assert_eq!(db.get_result(&key, OperationKind::Analyze)?.unwrap(), later);
        assert!(db.get_result(&key, OperationKind::Readme)?.is_none());
        Ok(())
    }

    #[test]
    fn test_hidden_set() -> Result<()> {
        let db = JobsDb::new_in_memory()?;
        let key = EntityKey::new("A", "Y");
        assert!(db.set_hidden(&key, true, t0())?);
        assert!(!db.set_hidden(&key, true, t0())?, "already hidden");
        assert_eq!(db.list_hidden()?, vec![EntityKey::new("a", "y")]);
        assert!(db.set_hidden(&key, false, t0())?);
        assert!(db.list_hidden()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_file_backed_db_persists_across_reopen() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("repowatch.db");
        {
            let db = JobsDb::new(&path)?;
            insert(&db, "j1", &analyze("o", "a"), 3, t0());
        }
        let db = JobsDb::new(&path)?;
        assert!(db.get_job_by_id("j1")?.is_some());
        Ok(())
    }
}
