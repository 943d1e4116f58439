//! In-memory execution records and the background loop that drives them.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::tasks::ClaimFilter;
use crate::worker::{RoutingOptions, TaskExecutor};

pub const DEFAULT_MAX_TASKS: u32 = 5;

fn default_max_tasks() -> u32 {
    DEFAULT_MAX_TASKS
}

/// `POST /execute` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u32,
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub prefer_free: Option<bool>,
}

impl ExecutionParams {
    pub fn claim_filter(&self) -> ClaimFilter {
        ClaimFilter {
            id_prefix: self.id_prefix.clone(),
            task_id: self.task_id.clone(),
            statuses: None,
        }
    }

    /// Request values override the process defaults.
    pub fn routing(&self, defaults: &RoutingOptions) -> RoutingOptions {
        RoutingOptions {
            backend: self.backend.clone().or_else(|| defaults.backend.clone()),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .or(defaults.timeout),
            prefer_free: self.prefer_free.unwrap_or(defaults.prefer_free),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub max_tasks: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub current_task_id: Option<String>,
    pub error: Option<String>,
}

/// Owned by the gateway process; lost on restart.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<String, Execution>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, max_tasks: u32) -> Execution {
        let execution = Execution {
            id: Uuid::new_v4().to_string(),
            status: ExecutionStatus::Pending,
            max_tasks,
            started_at: Utc::now(),
            completed_at: None,
            tasks_completed: 0,
            tasks_failed: 0,
            current_task_id: None,
            error: None,
        };
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        execution
    }

    pub async fn get(&self, id: &str) -> Option<Execution> {
        self.executions.read().await.get(id).cloned()
    }

    /// Newest first.
    pub async fn list(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self.executions.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        all
    }

    pub async fn running(&self) -> usize {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| !e.status.is_finished())
            .count()
    }

    async fn update(&self, id: &str, f: impl FnOnce(&mut Execution)) {
        if let Some(execution) = self.executions.write().await.get_mut(id) {
            f(execution);
        }
    }
}

/// Claim and run tasks one at a time until `max_tasks` have been processed,
/// nothing eligible remains, or `shutdown` fires between tasks.
pub async fn drive_execution(
    registry: &ExecutionRegistry,
    executor: TaskExecutor,
    execution_id: String,
    params: ExecutionParams,
    shutdown: CancellationToken,
) {
    let claimer = format!("gateway-{}", &execution_id[..8.min(execution_id.len())]);
    let filter = params.claim_filter();
    registry
        .update(&execution_id, |e| e.status = ExecutionStatus::Running)
        .await;
    info!(execution_id = %execution_id, max_tasks = params.max_tasks, "Execution started");

    let mut processed = 0;
    while processed < params.max_tasks {
        if shutdown.is_cancelled() {
            info!(execution_id = %execution_id, "Execution stopped by shutdown");
            break;
        }

        let task = match executor.store().claim_next(&claimer, &filter).await {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Execution claim failed");
                registry
                    .update(&execution_id, |ex| {
                        ex.status = ExecutionStatus::Failed;
                        ex.error = Some(e.to_string());
                        ex.current_task_id = None;
                        ex.completed_at = Some(Utc::now());
                    })
                    .await;
                return;
            }
        };

        let task_id = task.id.clone();
        registry
            .update(&execution_id, |e| e.current_task_id = Some(task_id.clone()))
            .await;

        let outcome = executor.execute(task).await;
        processed += 1;
        registry
            .update(&execution_id, |e| {
                if outcome.is_completed() {
                    e.tasks_completed += 1;
                } else {
                    e.tasks_failed += 1;
                }
                e.current_task_id = None;
            })
            .await;
    }

    registry
        .update(&execution_id, |e| {
            e.status = ExecutionStatus::Completed;
            e.completed_at = Some(Utc::now());
        })
        .await;
    info!(execution_id = %execution_id, processed, "Execution finished");
}
