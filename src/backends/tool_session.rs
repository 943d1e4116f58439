//! Backend that runs a tool-execution session and commits its changes.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{Backend, BackendInfo, BackendResult, ExecutionRequest, Findings, ResultStatus};
use crate::error::BackendError;
use crate::session::ToolSession;

pub struct ToolSessionBackend {
    info: BackendInfo,
    session: Arc<ToolSession>,
}

impl ToolSessionBackend {
    pub fn new(info: BackendInfo, session: ToolSession) -> Self {
        Self {
            info,
            session: Arc::new(session),
        }
    }
}

#[async_trait]
impl Backend for ToolSessionBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, BackendError> {
        let started = Instant::now();
        let outcome = self
            .session
            .run(&request.task)
            .await
            .map_err(|source| BackendError::Session {
                backend: self.info.name.clone(),
                source,
            })?;

        Ok(BackendResult {
            backend: self.info.name.clone(),
            status: ResultStatus::Success,
            summary: outcome.summary,
            findings: Findings::ToolSession {
                turns: outcome.turns,
                commit_message: outcome.commit_message,
                commit_ref: outcome.commit_ref.clone(),
            },
            cost_estimate: outcome.cost,
            duration_seconds: started.elapsed().as_secs_f64(),
            // The model asserted every criterion; nothing here verifies it.
            confidence: 0.8,
            artifact_ref: outcome.commit_ref,
        })
    }
}
