//! Task data model: the unit of work, its lifecycle, and query shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retry ceiling for a new task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Todo,
    /// Claimed by exactly one worker.
    InProgress,
    /// Finished successfully.
    Done,
    /// Last attempt failed; may be retried while under the retry ceiling.
    Failed,
}

impl TaskStatus {
    /// Check whether a worker may move a task from this state to `target`.
    ///
    /// Manual edits through the gateway are not bound by this table.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Todo, InProgress) | (Failed, InProgress) | (InProgress, Done) | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Urgency band derived from the numeric priority (lower number = more urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Critical,
    High,
    Normal,
    Low,
}

impl PriorityLevel {
    pub fn from_priority(priority: i64) -> Self {
        match priority {
            i64::MIN..=0 => Self::Critical,
            1 => Self::High,
            2..=3 => Self::Normal,
            _ => Self::Low,
        }
    }

    /// Critical and high priority work is routed to the most reliable backend.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }
}

/// A task as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable external key.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Lower number = more urgent.
    pub priority: i64,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Preferred backend name supplied at submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_hint: Option<String>,
    pub assigned_worker_id: Option<String>,
    /// Pointer to the produced artifact (commit id or stored result id).
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::from_priority(self.priority)
    }

    /// Whether `claim_next` may pick this task up.
    pub fn is_claimable(&self) -> bool {
        self.retry_count < self.max_retries
            && matches!(self.status, TaskStatus::Todo | TaskStatus::Failed)
    }

    /// Apply a manual edit, keeping the status invariants intact.
    pub fn apply_patch(&mut self, patch: &TaskPatch, now: DateTime<Utc>) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref description) = patch.description {
            self.description = description.clone();
        }
        if let Some(ref criteria) = patch.acceptance_criteria {
            self.acceptance_criteria = criteria.clone();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(ref hint) = patch.backend_hint {
            self.backend_hint = if hint.is_empty() {
                None
            } else {
                Some(hint.clone())
            };
        }
        if let Some(status) = patch.status
            && status != self.status
        {
            self.status = status;
            match status {
                TaskStatus::Todo => {
                    self.assigned_worker_id = None;
                    self.started_at = None;
                    self.completed_at = None;
                }
                TaskStatus::InProgress => {
                    self.started_at = Some(now);
                    self.completed_at = None;
                }
                TaskStatus::Done => {
                    self.completed_at = Some(now);
                    self.error_message = None;
                }
                TaskStatus::Failed => {
                    self.completed_at = Some(now);
                }
            }
        }
        if let Some(retry_count) = patch.retry_count {
            self.retry_count = retry_count;
        }
        self.updated_at = now;
    }

    /// Client-facing projection with computed age.
    pub fn to_record(&self, now: DateTime<Utc>) -> TaskRecord {
        let age = now.signed_duration_since(self.created_at);
        TaskRecord {
            task: self.clone(),
            age_seconds: age.num_milliseconds().max(0) as f64 / 1000.0,
        }
    }
}

/// Task as returned by the gateway: every stored attribute plus `age_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(flatten)]
    pub task: Task,
    pub age_seconds: f64,
}

/// Submission payload for a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority: 0,
            backend_hint: None,
            max_retries: None,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: append an acceptance criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.acceptance_criteria.push(criterion.into());
        self
    }

    /// Builder: set the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builder: set the backend hint.
    pub fn with_backend_hint(mut self, backend: impl Into<String>) -> Self {
        self.backend_hint = Some(backend.into());
        self
    }

    /// Reject submissions with a blank id or title.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.trim().is_empty() {
            return Err("id must not be empty");
        }
        if self.title.trim().is_empty() {
            return Err("title must not be empty");
        }
        Ok(())
    }

    /// Materialize a `todo` task created at `now`.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id,
            title: self.title,
            description: self.description,
            acceptance_criteria: self.acceptance_criteria,
            priority: self.priority,
            status: TaskStatus::Todo,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            backend_hint: self.backend_hint,
            assigned_worker_id: None,
            result_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Partial update for manual edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Empty string clears the hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_hint: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.acceptance_criteria.is_none()
            && self.priority.is_none()
            && self.status.is_none()
            && self.max_retries.is_none()
            && self.retry_count.is_none()
            && self.backend_hint.is_none()
    }
}

/// Restricts which tasks `claim_next` may pick.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Only ids starting with this prefix.
    pub id_prefix: Option<String>,
    /// Only this exact task.
    pub task_id: Option<String>,
    /// Subset of {todo, failed}; `None` means both.
    pub statuses: Option<Vec<TaskStatus>>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<TaskStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }
}

/// Listing query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}
