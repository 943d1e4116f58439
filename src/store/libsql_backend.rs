//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local files, in-memory databases, and remote libSQL servers.
//! Timestamps are written as fixed-width RFC 3339 (microseconds, `Z`) so
//! lexical order equals chronological order inside SQL.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::BackendResult;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{StoredResult, TaskStore};
use crate::tasks::{ClaimFilter, NewTask, Task, TaskPatch, TaskQuery, TaskStatus};
use crate::worker::heartbeat::Heartbeat;

const TASK_COLUMNS: &str = "id, title, description, acceptance_criteria, priority, status, \
     retry_count, max_retries, backend_hint, assigned_worker_id, result_ref, error_message, \
     created_at, updated_at, started_at, completed_at";

/// libSQL task store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open a store from a connection string.
    ///
    /// `libsql://`, `http://` and `https://` URLs go to a remote server
    /// (with `auth_token`); `:memory:` opens an in-memory database; anything
    /// else is treated as a local file path.
    pub async fn connect(url: &str, auth_token: Option<&str>) -> Result<Self, DatabaseError> {
        if url.starts_with("libsql://") || url.starts_with("http://") || url.starts_with("https://")
        {
            Self::new_remote(url, auth_token.unwrap_or_default()).await
        } else if url == ":memory:" {
            Self::new_memory().await
        } else {
            Self::new_local(Path::new(url)).await
        }
    }

    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
        })?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(backend)
    }

    /// Connect to a remote libSQL server.
    pub async fn new_remote(url: &str, auth_token: &str) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to reach {url}: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(url, "Remote task store connected");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a statement with `RETURNING {TASK_COLUMNS}` and read at most one task.
    async fn query_task(
        &self,
        op: &str,
        sql: &str,
        params: Vec<libsql::Value>,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| query_error(op, e))?;

        let row = rows.next().await.map_err(|e| query_error(op, e))?;
        match row {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    /// Explain why a worker transition matched no row.
    async fn transition_error(&self, id: &str, worker_id: &str, target: TaskStatus) -> DatabaseError {
        match self.get(id).await {
            Ok(Some(task))
                if task.status == TaskStatus::InProgress
                    && task.assigned_worker_id.as_deref() != Some(worker_id) =>
            {
                DatabaseError::Conflict { id: id.to_string() }
            }
            Ok(Some(task)) => DatabaseError::InvalidTransition {
                id: id.to_string(),
                state: task.status.to_string(),
                target: target.to_string(),
            },
            Ok(None) => DatabaseError::task_not_found(id),
            Err(e) => e,
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn text(s: impl Into<String>) -> libsql::Value {
    libsql::Value::Text(s.into())
}

/// Map a libsql error, classifying transport failures as `Connection`.
fn query_error(op: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("connection")
        || lower.contains("connect error")
        || lower.contains("timed out")
        || lower.contains("dns")
    {
        DatabaseError::Connection(format!("{op}: {message}"))
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let col = |name: &str, e: libsql::Error| DatabaseError::Query(format!("task.{name}: {e}"));

    let id: String = row.get(0).map_err(|e| col("id", e))?;
    let title: String = row.get(1).map_err(|e| col("title", e))?;
    let description: String = row.get::<Option<String>>(2).ok().flatten().unwrap_or_default();

    let criteria_raw: String = row
        .get::<Option<String>>(3)
        .ok()
        .flatten()
        .unwrap_or_else(|| "[]".to_string());
    let acceptance_criteria: Vec<String> = serde_json::from_str(&criteria_raw).map_err(|e| {
        DatabaseError::Serialization(format!("task {id} acceptance_criteria: {e}"))
    })?;

    let priority: i64 = row.get(4).map_err(|e| col("priority", e))?;
    let status_raw: String = row.get(5).map_err(|e| col("status", e))?;
    let status: TaskStatus = status_raw
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("task {id}: {e}")))?;

    let retry_count: i64 = row.get(6).map_err(|e| col("retry_count", e))?;
    let max_retries: i64 = row.get(7).map_err(|e| col("max_retries", e))?;

    let created_raw: String = row.get(12).map_err(|e| col("created_at", e))?;
    let updated_raw: String = row.get(13).map_err(|e| col("updated_at", e))?;

    Ok(Task {
        id,
        title,
        description,
        acceptance_criteria,
        priority,
        status,
        retry_count: retry_count.max(0) as u32,
        max_retries: max_retries.max(0) as u32,
        backend_hint: row.get::<Option<String>>(8).ok().flatten(),
        assigned_worker_id: row.get::<Option<String>>(9).ok().flatten(),
        result_ref: row.get::<Option<String>>(10).ok().flatten(),
        error_message: row.get::<Option<String>>(11).ok().flatten(),
        created_at: parse_datetime(&created_raw),
        updated_at: parse_datetime(&updated_raw),
        started_at: parse_optional_datetime(row.get::<Option<String>>(14).ok().flatten()),
        completed_at: parse_optional_datetime(row.get::<Option<String>>(15).ok().flatten()),
    })
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Connection(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Connection(format!("ping: {e}")))?;
        Ok(())
    }

    async fn enqueue(&self, task: NewTask) -> Result<Task, DatabaseError> {
        let task = task.into_task(Utc::now());
        let criteria = serde_json::to_string(&task.acceptance_criteria)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let result = self
            .conn()
            .execute(
                "INSERT INTO tasks (id, title, description, acceptance_criteria, priority, status, retry_count, max_retries, backend_hint, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?9)",
                params![
                    task.id.as_str(),
                    task.title.as_str(),
                    task.description.as_str(),
                    criteria,
                    task.priority,
                    task.status.as_str(),
                    task.max_retries as i64,
                    opt_text(task.backend_hint.as_deref()),
                    fmt_ts(task.created_at),
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(task_id = %task.id, priority = task.priority, "Task enqueued");
                Ok(task)
            }
            Err(e) if e.to_string().contains("UNIQUE") => Err(DatabaseError::DuplicateKey {
                entity: "task".to_string(),
                id: task.id,
            }),
            Err(e) => Err(query_error("enqueue", e)),
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let mut params: Vec<libsql::Value> = vec![text(worker_id), text(now)];
        let mut conditions = vec![
            "status IN ('todo', 'failed')".to_string(),
            "retry_count < max_retries".to_string(),
        ];

        if let Some(ref statuses) = filter.statuses {
            let allowed: Vec<&str> = statuses
                .iter()
                .filter(|s| matches!(s, TaskStatus::Todo | TaskStatus::Failed))
                .map(|s| s.as_str())
                .collect();
            if allowed.is_empty() {
                return Ok(None);
            }
            let mut placeholders = Vec::with_capacity(allowed.len());
            for status in allowed {
                params.push(text(status));
                placeholders.push(format!("?{}", params.len()));
            }
            conditions.push(format!("status IN ({})", placeholders.join(", ")));
        }
        if let Some(ref prefix) = filter.id_prefix {
            params.push(text(prefix.as_str()));
            let n = params.len();
            conditions.push(format!("substr(id, 1, length(?{n})) = ?{n}"));
        }
        if let Some(ref task_id) = filter.task_id {
            params.push(text(task_id.as_str()));
            conditions.push(format!("id = ?{}", params.len()));
        }

        // Single conditional UPDATE: the subquery picks, the outer WHERE
        // re-checks eligibility so a concurrent claimer gets zero rows.
        let sql = format!(
            "UPDATE tasks
             SET status = 'in_progress', assigned_worker_id = ?1, started_at = ?2,
                 updated_at = ?2, completed_at = NULL
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE {}
                 ORDER BY priority ASC, created_at ASC, rowid ASC
                 LIMIT 1
             )
             AND status IN ('todo', 'failed') AND retry_count < max_retries
             RETURNING {TASK_COLUMNS}",
            conditions.join(" AND ")
        );

        let claimed = self.query_task("claim_next", &sql, params).await?;
        if let Some(ref task) = claimed {
            debug!(task_id = %task.id, worker_id, "Task claimed");
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_ref: Option<&str>,
    ) -> Result<Task, DatabaseError> {
        let sql = format!(
            "UPDATE tasks
             SET status = 'done', result_ref = ?3, error_message = NULL,
                 completed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'in_progress' AND assigned_worker_id = ?2
             RETURNING {TASK_COLUMNS}"
        );
        let params = vec![
            text(id),
            text(worker_id),
            opt_text(result_ref),
            text(fmt_ts(Utc::now())),
        ];

        match self.query_task("complete", &sql, params).await? {
            Some(task) => Ok(task),
            None => Err(self.transition_error(id, worker_id, TaskStatus::Done).await),
        }
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<Task, DatabaseError> {
        let sql = format!(
            "UPDATE tasks
             SET status = 'failed', error_message = ?3, retry_count = retry_count + 1,
                 completed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status = 'in_progress' AND assigned_worker_id = ?2
             RETURNING {TASK_COLUMNS}"
        );
        let params = vec![
            text(id),
            text(worker_id),
            text(error_message),
            text(fmt_ts(Utc::now())),
        ];

        match self.query_task("fail", &sql, params).await? {
            Some(task) => Ok(task),
            None => Err(self.transition_error(id, worker_id, TaskStatus::Failed).await),
        }
    }

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| DatabaseError::task_not_found(id))?;
        if patch.is_empty() {
            return Ok(current);
        }

        let mut task = current.clone();
        task.apply_patch(patch, Utc::now());
        let criteria = serde_json::to_string(&task.acceptance_criteria)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let sql = format!(
            "UPDATE tasks
             SET title = ?3, description = ?4, acceptance_criteria = ?5, priority = ?6,
                 status = ?7, retry_count = ?8, max_retries = ?9, backend_hint = ?10,
                 assigned_worker_id = ?11, error_message = ?12, updated_at = ?13,
                 started_at = ?14, completed_at = ?15
             WHERE id = ?1 AND status = ?2 AND updated_at = ?16
             RETURNING {TASK_COLUMNS}"
        );
        let params = vec![
            text(id),
            text(current.status.as_str()),
            text(task.title.as_str()),
            text(task.description.as_str()),
            text(criteria),
            libsql::Value::Integer(task.priority),
            text(task.status.as_str()),
            libsql::Value::Integer(task.retry_count as i64),
            libsql::Value::Integer(task.max_retries as i64),
            opt_text(task.backend_hint.as_deref()),
            opt_text(task.assigned_worker_id.as_deref()),
            opt_text(task.error_message.as_deref()),
            text(fmt_ts(task.updated_at)),
            opt_ts(task.started_at),
            opt_ts(task.completed_at),
            text(fmt_ts(current.updated_at)),
        ];

        match self.query_task("update", &sql, params).await? {
            Some(updated) => {
                debug!(task_id = id, status = %updated.status, "Task updated");
                Ok(updated)
            }
            None => Err(DatabaseError::Conflict { id: id.to_string() }),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        self.query_task("get", &sql, vec![text(id)]).await
    }

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError> {
        let mut params: Vec<libsql::Value> = Vec::new();
        let mut conditions: Vec<String> = Vec::new();

        if let Some(status) = query.status {
            params.push(text(status.as_str()));
            conditions.push(format!("status = ?{}", params.len()));
        }
        if let Some(ref prefix) = query.id_prefix {
            params.push(text(prefix.as_str()));
            let n = params.len();
            conditions.push(format!("substr(id, 1, length(?{n})) = ?{n}"));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        params.push(libsql::Value::Integer(
            query.limit.map(i64::from).unwrap_or(-1),
        ));

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_clause}
             ORDER BY priority ASC, created_at ASC, rowid ASC
             LIMIT ?{}",
            params.len()
        );

        let mut rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(params))
            .await
            .map_err(|e| query_error("list", e))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_error("list", e))? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM task_results WHERE task_id = ?1", params![id])
            .await
            .map_err(|e| query_error("delete results", e))?;
        let affected = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| query_error("delete", e))?;
        if affected > 0 {
            info!(task_id = id, "Task deleted");
        }
        Ok(affected > 0)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, DatabaseError> {
        let now = Utc::now();
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| DatabaseError::Query(format!("requeue_stale threshold: {e}")))?;
        let cutoff = now - older_than;

        let count = self
            .conn()
            .execute(
                "UPDATE tasks
                 SET status = 'todo', assigned_worker_id = NULL, started_at = NULL, updated_at = ?1
                 WHERE status = 'in_progress' AND started_at < ?2",
                params![fmt_ts(now), fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| query_error("requeue_stale", e))?;

        if count > 0 {
            warn!(count, cutoff = %fmt_ts(cutoff), "Requeued stale in-progress tasks");
        }
        Ok(count)
    }

    async fn save_result(
        &self,
        task_id: &str,
        result: &BackendResult,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(result)
            .map_err(|e| DatabaseError::Serialization(format!("backend result: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO task_results (id, task_id, backend, status, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    task_id,
                    result.backend.as_str(),
                    result.status.as_str(),
                    payload,
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| query_error("save_result", e))?;

        debug!(task_id, result_id = %id, backend = %result.backend, "Backend result stored");
        Ok(id)
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<StoredResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, payload, created_at FROM task_results
                 WHERE task_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![task_id],
            )
            .await
            .map_err(|e| query_error("get_result", e))?;

        let Some(row) = rows.next().await.map_err(|e| query_error("get_result", e))? else {
            return Ok(None);
        };

        let id: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("result.id: {e}")))?;
        let task_id: String = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("result.task_id: {e}")))?;
        let payload: String = row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("result.payload: {e}")))?;
        let created_raw: String = row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("result.created_at: {e}")))?;

        let result: BackendResult = serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("result {id}: {e}")))?;

        Ok(Some(StoredResult {
            id,
            task_id,
            result,
            created_at: parse_datetime(&created_raw),
        }))
    }

    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO worker_heartbeats (worker_id, state, tasks_completed, tasks_failed, active_tasks, uptime_seconds, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(worker_id) DO UPDATE SET
                     state = excluded.state,
                     tasks_completed = excluded.tasks_completed,
                     tasks_failed = excluded.tasks_failed,
                     active_tasks = excluded.active_tasks,
                     uptime_seconds = excluded.uptime_seconds,
                     recorded_at = excluded.recorded_at",
                params![
                    heartbeat.worker_id.as_str(),
                    heartbeat.state.as_str(),
                    heartbeat.tasks_completed as i64,
                    heartbeat.tasks_failed as i64,
                    heartbeat.active_tasks as i64,
                    heartbeat.uptime_seconds,
                    fmt_ts(heartbeat.timestamp),
                ],
            )
            .await
            .map_err(|e| query_error("record_heartbeat", e))?;
        Ok(())
    }
}
