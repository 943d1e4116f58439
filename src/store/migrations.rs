//! Version-tracked schema migrations for the libSQL task store.
//!
//! Steps are append-only; `schema_version` records which have run.

use chrono::Utc;
use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'todo',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                backend_hint TEXT,
                assigned_worker_id TEXT,
                result_ref TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_claim
                ON tasks(status, priority, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "task_results",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_results (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_results_task
                ON task_results(task_id, created_at);
        "#,
    },
    Migration {
        version: 3,
        name: "worker_heartbeats",
        sql: r#"
            CREATE TABLE IF NOT EXISTS worker_heartbeats (
                worker_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                tasks_completed INTEGER NOT NULL DEFAULT 0,
                tasks_failed INTEGER NOT NULL DEFAULT 0,
                active_tasks INTEGER NOT NULL DEFAULT 0,
                uptime_seconds REAL NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL
            );
        "#,
    },
];

/// Bring the schema up to the latest step. Each step runs in its own
/// transaction together with its `schema_version` row.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for step in pending {
        tracing::info!(version = step.version, label = step.name, "Migrating task store");
        let fail = |e: libsql::Error| {
            DatabaseError::Migration(format!("step {} ({}): {e}", step.version, step.name))
        };
        let tx = conn.transaction().await.map_err(fail)?;
        tx.execute_batch(step.sql).await.map_err(fail)?;
        tx.execute(
            "INSERT INTO schema_version (version, label, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![step.version, step.name, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(fail)?;
        tx.commit().await.map_err(fail)?;
    }
    Ok(())
}

/// Highest applied step, 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema_version read: {e}"));
    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
