//! Shared fixtures: scripted LLM, mock backends, recording committer and a
//! store that is never reachable.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ai_taskd::backends::{
    Backend, BackendInfo, BackendResult, ExecutionRequest, Findings, ResultStatus,
};
use ai_taskd::error::{BackendError, DatabaseError, LlmError, SessionError};
use ai_taskd::gateway::{self, AppState};
use ai_taskd::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, TokenUsage, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};
use ai_taskd::session::Committer;
use ai_taskd::store::{StoredResult, TaskStore};
use ai_taskd::tasks::{ClaimFilter, NewTask, Task, TaskPatch, TaskQuery};
use ai_taskd::worker::Heartbeat;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── LLM ─────────────────────────────────────────────────────────────

/// Replays one list of tool calls per turn at fixed per-token prices.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<ToolCall>>>,
    usage: TokenUsage,
    rates: (Decimal, Decimal),
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<ToolCall>>, rates: (Decimal, Decimal)) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            rates,
        })
    }
}

pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.rates
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: "scripted answer".to_string(),
            usage: self.usage,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn complete_with_tools(
        &self,
        _request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let tool_calls = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(ToolCompletionResponse {
            content: None,
            tool_calls,
            usage: self.usage,
            finish_reason: FinishReason::ToolUse,
        })
    }
}

// ── Committer ───────────────────────────────────────────────────────

/// Records commit messages and answers with a fixed commit id.
pub struct RecordingCommitter {
    pub messages: Mutex<Vec<String>>,
    commit_id: String,
}

impl RecordingCommitter {
    pub fn new(commit_id: &str) -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            commit_id: commit_id.to_string(),
        })
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Committer for RecordingCommitter {
    async fn commit(&self, message: &str) -> Result<Option<String>, SessionError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(Some(self.commit_id.clone()))
    }

    async fn discard(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

// ── Backends ────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub enum MockBehavior {
    Succeed,
    Fail,
}

/// Backend with a fixed behavior, cost and optional delay.
pub struct MockBackend {
    info: BackendInfo,
    behavior: MockBehavior,
    cost: Decimal,
    delay: Duration,
    calls: AtomicU32,
    seen: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(name: &str, behavior: MockBehavior, cost: Decimal) -> Arc<Self> {
        Self::build(BackendInfo::new(name), behavior, cost, Duration::ZERO)
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::build(BackendInfo::new(name), MockBehavior::Succeed, Decimal::ZERO, delay)
    }

    fn build(info: BackendInfo, behavior: MockBehavior, cost: Decimal, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            info,
            behavior,
            cost,
            delay,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Task ids in execution order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.task.id.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behavior {
            MockBehavior::Fail => Err(BackendError::execution(&self.info.name, "mock failure")),
            MockBehavior::Succeed => Ok(BackendResult {
                backend: self.info.name.clone(),
                status: ResultStatus::Success,
                summary: format!("{} handled {}", self.info.name, request.task.id),
                findings: Findings::Research {
                    answer: "mock".to_string(),
                    model: "mock".to_string(),
                },
                cost_estimate: self.cost,
                duration_seconds: self.delay.as_secs_f64(),
                confidence: 0.9,
                artifact_ref: None,
            }),
        }
    }
}

pub fn backends(list: Vec<Arc<MockBackend>>) -> Vec<Arc<dyn Backend>> {
    list.into_iter().map(|b| b as Arc<dyn Backend>).collect()
}

// ── Store ───────────────────────────────────────────────────────────

/// Every call fails as a connection error.
pub struct UnreachableStore;

fn down() -> DatabaseError {
    DatabaseError::Connection("connection refused".to_string())
}

#[async_trait]
impl TaskStore for UnreachableStore {
    async fn ping(&self) -> Result<(), DatabaseError> {
        Err(down())
    }

    async fn enqueue(&self, _task: NewTask) -> Result<Task, DatabaseError> {
        Err(down())
    }

    async fn claim_next(
        &self,
        _worker_id: &str,
        _filter: &ClaimFilter,
    ) -> Result<Option<Task>, DatabaseError> {
        Err(down())
    }

    async fn complete(
        &self,
        _id: &str,
        _worker_id: &str,
        _result_ref: Option<&str>,
    ) -> Result<Task, DatabaseError> {
        Err(down())
    }

    async fn fail(
        &self,
        _id: &str,
        _worker_id: &str,
        _error_message: &str,
    ) -> Result<Task, DatabaseError> {
        Err(down())
    }

    async fn update(&self, _id: &str, _patch: &TaskPatch) -> Result<Task, DatabaseError> {
        Err(down())
    }

    async fn get(&self, _id: &str) -> Result<Option<Task>, DatabaseError> {
        Err(down())
    }

    async fn list(&self, _query: &TaskQuery) -> Result<Vec<Task>, DatabaseError> {
        Err(down())
    }

    async fn delete(&self, _id: &str) -> Result<bool, DatabaseError> {
        Err(down())
    }

    async fn requeue_stale(&self, _older_than: Duration) -> Result<u64, DatabaseError> {
        Err(down())
    }

    async fn save_result(
        &self,
        _task_id: &str,
        _result: &BackendResult,
    ) -> Result<String, DatabaseError> {
        Err(down())
    }

    async fn get_result(&self, _task_id: &str) -> Result<Option<StoredResult>, DatabaseError> {
        Err(down())
    }

    async fn record_heartbeat(&self, _heartbeat: &Heartbeat) -> Result<(), DatabaseError> {
        Err(down())
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// A gateway served on an ephemeral port.
pub struct TestGateway {
    pub base_url: String,
    pub shutdown: CancellationToken,
    pub state: AppState,
}

pub async fn spawn_gateway(state: AppState) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = state.shutdown.clone();
    let serve_state = state.clone();
    tokio::spawn(async move {
        gateway::serve(listener, serve_state).await.unwrap();
    });
    TestGateway {
        base_url: format!("http://{addr}"),
        shutdown,
        state,
    }
}

/// Poll `GET /executions/{id}` until it leaves pending/running.
pub async fn wait_for_execution(
    client: &reqwest::Client,
    base_url: &str,
    execution_id: &str,
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let body: serde_json::Value = client
            .get(format!("{base_url}/executions/{execution_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = body["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {execution_id} still {status}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
