//! Backend that hands the task to a remote ai-taskd gateway.
//!
//! The remote side gets the task (enqueued if absent), an execution scoped to
//! that task id, and is polled until the execution finishes. The remote task
//! record decides the outcome.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{Backend, BackendInfo, BackendResult, ExecutionRequest, Findings, ResultStatus};
use crate::error::BackendError;
use crate::tasks::{Task, TaskStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionView {
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredResultView {
    result: BackendResult,
}

pub struct DelegatedBackend {
    info: BackendInfo,
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    poll_interval: Duration,
}

impl DelegatedBackend {
    pub fn new(info: BackendInfo, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            info,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn err(&self, reason: impl Into<String>) -> BackendError {
        BackendError::execution(&self.info.name, reason)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    async fn fetch_task(&self, id: &str) -> Result<Option<Task>, BackendError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/tasks/{id}"))
            .send()
            .await
            .map_err(|e| self.err(format!("GET task: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<Task>()
                .await
                .map(Some)
                .map_err(|e| self.err(format!("decode task: {e}"))),
            s => Err(self.err(format!("GET task returned {s}"))),
        }
    }

    async fn ensure_enqueued(&self, task: &Task) -> Result<(), BackendError> {
        if self.fetch_task(&task.id).await?.is_some() {
            return Ok(());
        }
        let response = self
            .request(reqwest::Method::POST, "/tasks")
            .json(&json!({
                "id": task.id,
                "title": task.title,
                "description": task.description,
                "acceptance_criteria": task.acceptance_criteria,
                "priority": task.priority,
                "max_retries": task.max_retries,
                "backend_hint": task.backend_hint,
            }))
            .send()
            .await
            .map_err(|e| self.err(format!("POST task: {e}")))?;
        // 409 means another caller enqueued it first.
        match response.status() {
            s if s.is_success() || s == StatusCode::CONFLICT => Ok(()),
            s => Err(self.err(format!("POST task returned {s}"))),
        }
    }

    async fn start_execution(&self, task_id: &str) -> Result<String, BackendError> {
        let response = self
            .request(reqwest::Method::POST, "/execute")
            .json(&json!({ "max_tasks": 1, "task_id": task_id }))
            .send()
            .await
            .map_err(|e| self.err(format!("POST execute: {e}")))?;
        if !response.status().is_success() {
            return Err(self.err(format!("POST execute returned {}", response.status())));
        }
        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| self.err(format!("decode execution: {e}")))?;
        Ok(body.execution_id)
    }

    /// Poll until the execution leaves `pending`/`running`. The router's
    /// timeout bounds the wait.
    async fn wait_for(&self, execution_id: &str) -> Result<ExecutionView, BackendError> {
        loop {
            let response = self
                .request(reqwest::Method::GET, &format!("/executions/{execution_id}"))
                .send()
                .await
                .map_err(|e| self.err(format!("GET execution: {e}")))?;
            if !response.status().is_success() {
                return Err(self.err(format!("GET execution returned {}", response.status())));
            }
            let view: ExecutionView = response
                .json()
                .await
                .map_err(|e| self.err(format!("decode execution: {e}")))?;
            if view.status != "pending" && view.status != "running" {
                return Ok(view);
            }
            debug!(backend = %self.info.name, execution_id, status = %view.status, "Remote execution still active");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The remote task's stored result. 404 means none was saved.
    async fn fetch_result(&self, task_id: &str) -> Result<Option<BackendResult>, BackendError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/tasks/{task_id}/result"))
            .send()
            .await
            .map_err(|e| self.err(format!("GET result: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => response
                .json::<StoredResultView>()
                .await
                .map(|v| Some(v.result))
                .map_err(|e| self.err(format!("decode result: {e}"))),
            s => Err(self.err(format!("GET result returned {s}"))),
        }
    }
}

#[async_trait]
impl Backend for DelegatedBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, BackendError> {
        let started = Instant::now();
        let task = &request.task;

        self.ensure_enqueued(task).await?;
        let execution_id = self.start_execution(&task.id).await?;
        let execution = self.wait_for(&execution_id).await?;

        let remote = self
            .fetch_task(&task.id)
            .await?
            .ok_or_else(|| self.err(format!("remote task {} disappeared", task.id)))?;

        if remote.status != TaskStatus::Done {
            let reason = remote
                .error_message
                .or(execution.error)
                .unwrap_or_else(|| format!("remote task ended {}", remote.status));
            return Err(self.err(reason));
        }

        // The remote task is already done, so a missing result only costs
        // us the summary and cost details.
        let remote_result = match self.fetch_result(&task.id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(backend = %self.info.name, task_id = %task.id, error = %e, "Remote result unavailable");
                None
            }
        };
        let (summary, cost_estimate, confidence) = match &remote_result {
            Some(r) => (r.summary.clone(), r.cost_estimate, r.confidence),
            None => (format!("Completed remotely as {}", task.id), Decimal::ZERO, 0.5),
        };

        Ok(BackendResult {
            backend: self.info.name.clone(),
            status: ResultStatus::Success,
            summary,
            findings: Findings::Delegated {
                remote_task_id: remote.id,
                remote_status: remote.status.to_string(),
                remote_result_ref: remote.result_ref.clone(),
            },
            cost_estimate,
            duration_seconds: started.elapsed().as_secs_f64(),
            confidence,
            artifact_ref: remote_result.and_then(|r| r.artifact_ref),
        })
    }
}
