//! SQLite-backed task store.
//!
//! The single source of truth for task state. Multiple dispatcher instances
//! may mutate it concurrently; the only mutual-exclusion primitive they need
//! is the guarded claim (`UPDATE … WHERE status = 'pending'`) — all other
//! writes are owner-exclusive once a claim is held.

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{TaskPayload, TaskRecord, TaskStatus, TaskType};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ─── Row type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    payload: String,
    owner: Option<String>,
    result: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_record(self) -> Result<TaskRecord> {
        let task_type: TaskType = self
            .task_type
            .parse()
            .with_context(|| format!("task {} has unroutable type", self.id))?;
        let status: TaskStatus = self
            .status
            .parse()
            .with_context(|| format!("task {} has invalid status", self.id))?;
        let raw: Value = serde_json::from_str(&self.payload)
            .with_context(|| format!("task {} payload is not valid JSON", self.id))?;
        let payload = TaskPayload::parse(task_type, &raw)
            .with_context(|| format!("task {} payload failed validation", self.id))?;
        let result = match self.result {
            Some(s) => Some(serde_json::from_str(&s).unwrap_or(Value::String(s))),
            None => None,
        };
        Ok(TaskRecord {
            id: self.id,
            task_type,
            status,
            payload,
            owner: self.owner,
            result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Queue depth per status, for the health endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TaskStorage {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str =
    "id, task_type, status, payload, owner, result, error, created_at, updated_at";

impl TaskStorage {
    /// Open (or create) the task database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("pland.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                 id         TEXT PRIMARY KEY,
                 task_type  TEXT NOT NULL,
                 status     TEXT NOT NULL DEFAULT 'pending',
                 payload    TEXT NOT NULL,
                 owner      TEXT,
                 result     TEXT,
                 error      TEXT,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             )",
        )
        .execute(pool)
        .await
        .context("failed to create tasks table")?;

        // Composite index backing the oldest-first pending scan.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_created
             ON tasks(status, created_at)",
        )
        .execute(pool)
        .await
        .context("failed to create (status, created_at) index")?;

        Ok(())
    }

    // ─── Producer side ───────────────────────────────────────────────────────

    /// Insert a new `pending` record. A storage failure surfaces to the
    /// producer — tasks are never silently lost at creation.
    pub async fn create(&self, payload: &TaskPayload) -> Result<TaskRecord> {
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let payload_json = serde_json::to_string(&payload.to_value())?;
        let task_type = payload.task_type();

        with_timeout(async {
            sqlx::query(
                "INSERT INTO tasks (id, task_type, status, payload, created_at, updated_at)
                 VALUES (?, ?, 'pending', ?, ?, ?)",
            )
            .bind(&id)
            .bind(task_type.as_str())
            .bind(&payload_json)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("failed to insert task")?;
            Ok(())
        })
        .await?;

        Ok(TaskRecord {
            id,
            task_type,
            status: TaskStatus::Pending,
            payload: payload.clone(),
            owner: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row: Option<TaskRow> = with_timeout(async {
            sqlx::query_as(&format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to fetch task")
        })
        .await?;
        row.map(TaskRow::into_record).transpose()
    }

    // ─── Dispatcher side ─────────────────────────────────────────────────────

    /// Fetch up to `limit` pending records, oldest first (FIFO fairness),
    /// optionally filtered by type. Does not mark anything processing —
    /// callers race through [`try_claim`](Self::try_claim) afterwards.
    ///
    /// The preferred path forces the `(status, created_at)` index. If that
    /// query fails (e.g. the index is missing on a hand-migrated database),
    /// degrade to an unordered scan plus in-process sort — slower, never
    /// incorrect. Rows that fetch but fail to decode are failed individually
    /// and excluded — one bad row must not starve the rest of the queue.
    pub async fn fetch_pending(
        &self,
        limit: usize,
        type_filter: Option<TaskType>,
    ) -> Result<Vec<TaskRecord>> {
        let filter_sql = if type_filter.is_some() {
            " AND task_type = ?"
        } else {
            ""
        };
        let ordered_sql = format!(
            "SELECT {SELECT_COLUMNS} FROM tasks INDEXED BY idx_tasks_status_created
             WHERE status = 'pending'{filter_sql}
             ORDER BY created_at ASC LIMIT ?"
        );

        let mut q = sqlx::query_as::<_, TaskRow>(&ordered_sql);
        if let Some(t) = type_filter {
            q = q.bind(t.as_str());
        }
        q = q.bind(limit as i64);

        match with_timeout(async { q.fetch_all(&self.pool).await.map_err(Into::into) }).await {
            Ok(rows) => Ok(self.decode_rows(rows).await),
            Err(e) => {
                warn!(err = %e, "ordered pending scan failed — falling back to unindexed scan");
                self.fetch_pending_unordered(limit, type_filter).await
            }
        }
    }

    async fn fetch_pending_unordered(
        &self,
        limit: usize,
        type_filter: Option<TaskType>,
    ) -> Result<Vec<TaskRecord>> {
        let filter_sql = if type_filter.is_some() {
            " AND task_type = ?"
        } else {
            ""
        };
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM tasks WHERE status = 'pending'{filter_sql}");
        let mut q = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(t) = type_filter {
            q = q.bind(t.as_str());
        }
        let rows: Vec<TaskRow> =
            with_timeout(async { q.fetch_all(&self.pool).await.map_err(Into::into) }).await?;

        let mut records = self.decode_rows(rows).await;
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit);
        Ok(records)
    }

    /// Decode fetched rows one at a time. A row that fails decoding — an
    /// unroutable type or a payload that no longer validates — is marked
    /// failed with a classification error and dropped from the batch, so
    /// healthy records keep flowing.
    async fn decode_rows(&self, rows: Vec<TaskRow>) -> Vec<TaskRecord> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_record() {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(task_id = %id, err = %e, "undecodable task row — failing it");
                    if let Err(e) = self.fail(&id, &format!("unprocessable record: {e}")).await {
                        warn!(task_id = %id, err = %e, "could not mark undecodable row failed");
                    }
                }
            }
        }
        records
    }

    /// Atomically claim one record: `pending → processing` with `owner` set,
    /// succeeding only if the record is still `pending` at the moment of the
    /// transition. Under concurrent claimers exactly one wins; losing the
    /// race is expected and not an error.
    pub async fn try_claim(&self, id: &str, owner: &str) -> Result<bool> {
        let now = now_ms();
        let affected = with_timeout(async {
            sqlx::query(
                "UPDATE tasks
                 SET status = 'processing', owner = ?, updated_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(owner)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("claim update failed")
            .map(|r| r.rows_affected())
        })
        .await?;

        if affected == 0 {
            debug!(task_id = %id, "claim lost — record no longer pending");
        }
        Ok(affected > 0)
    }

    /// Record successful completion. Idempotent: if the record is already
    /// terminal this is a no-op, not an error — terminal states never revert.
    pub async fn complete(&self, id: &str, result: &Value) -> Result<()> {
        let now = now_ms();
        let result_json = serde_json::to_string(result)?;
        let affected = with_timeout(async {
            sqlx::query(
                "UPDATE tasks
                 SET status = 'completed', result = ?, owner = NULL, updated_at = ?
                 WHERE id = ? AND status NOT IN ('completed', 'failed')",
            )
            .bind(&result_json)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("complete update failed")
            .map(|r| r.rows_affected())
        })
        .await?;

        if affected == 0 {
            self.ensure_exists(id).await?;
            debug!(task_id = %id, "complete on already-terminal task — no-op");
        }
        Ok(())
    }

    /// Record failure. Same idempotence rule as [`complete`](Self::complete).
    pub async fn fail(&self, id: &str, error: &str) -> Result<()> {
        let now = now_ms();
        let affected = with_timeout(async {
            sqlx::query(
                "UPDATE tasks
                 SET status = 'failed', error = ?, owner = NULL, updated_at = ?
                 WHERE id = ? AND status NOT IN ('completed', 'failed')",
            )
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("fail update failed")
            .map(|r| r.rows_affected())
        })
        .await?;

        if affected == 0 {
            self.ensure_exists(id).await?;
            debug!(task_id = %id, "fail on already-terminal task — no-op");
        }
        Ok(())
    }

    async fn ensure_exists(&self, id: &str) -> Result<()> {
        let found: Option<(String,)> = with_timeout(async {
            sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("existence check failed")
        })
        .await?;
        if found.is_none() {
            return Err(anyhow!("task '{id}' not found"));
        }
        Ok(())
    }

    // ─── Reaper side ─────────────────────────────────────────────────────────

    /// IDs of pending records created before `cutoff_ms` — candidates for
    /// expiry without ever being claimed.
    pub async fn stale_pending(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = with_timeout(async {
            sqlx::query_as(
                "SELECT id FROM tasks WHERE status = 'pending' AND created_at < ?",
            )
            .bind(cutoff_ms)
            .fetch_all(&self.pool)
            .await
            .context("stale pending scan failed")
        })
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Fail a record only if it is still pending (`owner` never set).
    /// Returns false when a dispatcher claimed it between scan and update.
    pub async fn fail_if_pending(&self, id: &str, error: &str) -> Result<bool> {
        let now = now_ms();
        let affected = with_timeout(async {
            sqlx::query(
                "UPDATE tasks
                 SET status = 'failed', error = ?, updated_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("expiry update failed")
            .map(|r| r.rows_affected())
        })
        .await?;
        Ok(affected > 0)
    }

    // ─── Observability ───────────────────────────────────────────────────────

    pub async fn counts(&self) -> Result<TaskCounts> {
        let rows: Vec<(String, i64)> = with_timeout(async {
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .context("counts query failed")
        })
        .await?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            match status.as_str() {
                "pending" => counts.pending = n,
                "processing" => counts.processing = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}
