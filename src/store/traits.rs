//! `TaskStore` trait: the single async interface over task persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backends::BackendResult;
use crate::error::DatabaseError;
use crate::tasks::{ClaimFilter, NewTask, Task, TaskPatch, TaskQuery};
use crate::worker::heartbeat::Heartbeat;

/// A backend result persisted for a task.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResult {
    pub id: String,
    pub task_id: String,
    pub result: BackendResult,
    pub created_at: DateTime<Utc>,
}

/// Durable task queue.
///
/// Every lifecycle transition goes through one of these calls; no component
/// holds its own lock over task state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Insert a new `todo` task. Fails with `DuplicateKey` if the id exists.
    async fn enqueue(&self, task: NewTask) -> Result<Task, DatabaseError>;

    /// Atomically claim the most urgent eligible task for `worker_id`.
    ///
    /// Ordering is `(priority, created_at)` ascending. Returns `None` when
    /// nothing is eligible or another worker won the race.
    async fn claim_next(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
    ) -> Result<Option<Task>, DatabaseError>;

    /// `in_progress → done`, only for the worker holding the claim.
    ///
    /// Fails with `Conflict` when another worker has since reclaimed the task.
    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_ref: Option<&str>,
    ) -> Result<Task, DatabaseError>;

    /// `in_progress → failed`, incrementing `retry_count`. Guarded like `complete`.
    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error_message: &str,
    ) -> Result<Task, DatabaseError>;

    /// Manual edit. Fails with `Conflict` if the task changed underneath.
    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    async fn list(&self, query: &TaskQuery) -> Result<Vec<Task>, DatabaseError>;

    /// Remove a task and its stored results. Returns `false` if it did not exist.
    async fn delete(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Return `in_progress` tasks started before `now - older_than` to `todo`.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, DatabaseError>;

    /// Persist a backend result, returning its generated id.
    async fn save_result(&self, task_id: &str, result: &BackendResult)
    -> Result<String, DatabaseError>;

    /// Most recent stored result for a task.
    async fn get_result(&self, task_id: &str) -> Result<Option<StoredResult>, DatabaseError>;

    /// Upsert the latest heartbeat for a worker.
    async fn record_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), DatabaseError>;
}
