//! Runs one claimed task through the router and writes the outcome back.
//!
//! Shared by the worker loop and the gateway's execution driver so both
//! persist outcomes the same way.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::backends::{BackendResult, BackendRouter, ExecutionRequest};
use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::Task;

const OUTCOME_WRITE_ATTEMPTS: u32 = 3;
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Routing preferences applied to every task an executor runs.
#[derive(Debug, Clone, Default)]
pub struct RoutingOptions {
    pub backend: Option<String>,
    pub timeout: Option<Duration>,
    pub prefer_free: bool,
}

impl RoutingOptions {
    fn request_for(&self, task: Task) -> ExecutionRequest {
        ExecutionRequest {
            task,
            backend: self.backend.clone(),
            timeout: self.timeout,
            prefer_free: self.prefer_free,
        }
    }
}

/// Final state of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { result_ref: Option<String> },
    Failed { error: String },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    router: Arc<BackendRouter>,
    options: RoutingOptions,
}

impl TaskExecutor {
    pub fn new(store: Arc<dyn TaskStore>, router: Arc<BackendRouter>) -> Self {
        Self {
            store,
            router,
            options: RoutingOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RoutingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    /// Execute a task already claimed as `in_progress` and record the outcome.
    pub async fn execute(&self, task: Task) -> TaskOutcome {
        let task_id = task.id.clone();
        let worker_id = task.assigned_worker_id.clone().unwrap_or_default();
        let request = self.options.request_for(task);

        let routed = AssertUnwindSafe(self.router.execute(&request))
            .catch_unwind()
            .await;

        let outcome = match routed {
            Ok(Ok(result)) => {
                let result_ref = self.persist_result(&task_id, &result).await;
                TaskOutcome::Completed { result_ref }
            }
            Ok(Err(e)) => TaskOutcome::Failed {
                error: e.to_string(),
            },
            Err(panic) => TaskOutcome::Failed {
                error: format!("execution panicked: {}", panic_message(panic.as_ref())),
            },
        };

        self.record_outcome(&task_id, &worker_id, &outcome).await;
        outcome
    }

    async fn persist_result(&self, task_id: &str, result: &BackendResult) -> Option<String> {
        let saved = retry_write("save_result", task_id, || {
            self.store.save_result(task_id, result)
        })
        .await;
        result.artifact_ref.clone().or(saved)
    }

    async fn record_outcome(&self, task_id: &str, worker_id: &str, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed { result_ref } => {
                let written = retry_write("complete", task_id, || {
                    self.store.complete(task_id, worker_id, result_ref.as_deref())
                })
                .await;
                if written.is_some() {
                    info!(task_id, result_ref = result_ref.as_deref().unwrap_or("-"), "Task done");
                }
            }
            TaskOutcome::Failed { error } => {
                if let Some(task) =
                    retry_write("fail", task_id, || self.store.fail(task_id, worker_id, error)).await
                {
                    warn!(
                        task_id,
                        retry_count = task.retry_count,
                        max_retries = task.max_retries,
                        error = %error,
                        "Task failed"
                    );
                }
            }
        }
    }
}

/// Retry an outcome write a few times. Giving up leaves the task
/// `in_progress` for the stale requeue to recover.
async fn retry_write<T, F, Fut>(op: &str, task_id: &str, mut write: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DatabaseError>>,
{
    for attempt in 1..=OUTCOME_WRITE_ATTEMPTS {
        match write().await {
            Ok(value) => return Some(value),
            // Not retryable: the task moved on without us.
            Err(
                e @ (DatabaseError::InvalidTransition { .. }
                | DatabaseError::NotFound { .. }
                | DatabaseError::Conflict { .. }),
            ) => {
                warn!(task_id, op, error = %e, "Outcome write rejected");
                return None;
            }
            Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                warn!(task_id, op, attempt, error = %e, "Outcome write failed, retrying");
                tokio::time::sleep(OUTCOME_RETRY_DELAY * attempt).await;
            }
            Err(e) => {
                error!(task_id, op, error = %e, "Outcome write abandoned");
            }
        }
    }
    None
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
