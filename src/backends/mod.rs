//! Pluggable execution backends and the router that chooses between them.
//!
//! A backend takes a claimed task and produces a [`BackendResult`]. The router
//! only reads `status`, `cost_estimate` and `confidence`; everything
//! family-specific lives in [`Findings`].

pub mod delegated;
pub mod research;
pub mod router;
pub mod tool_session;

pub use delegated::DelegatedBackend;
pub use research::ResearchBackend;
pub use router::{BackendRouter, BackendStats, RouterStatus};
pub use tool_session::ToolSessionBackend;

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::tasks::Task;

/// Default per-call timeout when a backend declares none.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Cost class of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Free,
    Paid,
}

impl std::str::FromStr for CostTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "low" | "low_cost" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            other => Err(format!("unknown cost tier '{other}'")),
        }
    }
}

/// Static description of a backend, fixed at construction.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub tier: CostTier,
    /// Higher is more reliable.
    pub reliability: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl BackendInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: CostTier::Paid,
            reliability: 1,
            timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }

    pub fn with_tier(mut self, tier: CostTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_reliability(mut self, reliability: u32) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_free(&self) -> bool {
        self.tier == CostTier::Free
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

/// One routed execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Task,
    /// Caller-chosen backend; overrides every other selection rule.
    pub backend: Option<String>,
    /// Expected duration; over 30 minutes routes to the most reliable backend.
    pub timeout: Option<Duration>,
    pub prefer_free: bool,
}

impl ExecutionRequest {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            backend: None,
            timeout: None,
            prefer_free: false,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_prefer_free(mut self, prefer_free: bool) -> Self {
        self.prefer_free = prefer_free;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Family-specific payload of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Findings {
    ToolSession {
        turns: u32,
        commit_message: String,
        commit_ref: Option<String>,
    },
    Research {
        answer: String,
        model: String,
    },
    Delegated {
        remote_task_id: String,
        remote_status: String,
        remote_result_ref: Option<String>,
    },
}

/// Immutable outcome of a backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend: String,
    pub status: ResultStatus,
    pub summary: String,
    pub findings: Findings,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost_estimate: Decimal,
    pub duration_seconds: f64,
    /// 0.0 to 1.0.
    pub confidence: f32,
    /// Durable artifact produced by the call, such as a commit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

impl BackendResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn info(&self) -> &BackendInfo;

    /// Run the task once. Errors are recoverable by falling back unless
    /// [`BackendError::is_terminal`] says otherwise.
    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, BackendError>;
}
