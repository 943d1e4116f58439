//! `complete_task`: the only accepted completion signal for a session.

use async_trait::async_trait;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

pub const COMPLETE_TASK: &str = "complete_task";

/// Arguments of a `complete_task` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub summary: String,
    pub commit_message: String,
}

impl Completion {
    pub fn from_params(params: &serde_json::Value) -> Result<Self, ToolError> {
        let summary = require_str(params, "summary")?.trim();
        let commit_message = require_str(params, "commit_message")?.trim();
        if commit_message.is_empty() {
            return Err(ToolError::InvalidParameters(
                "commit_message must not be empty".to_string(),
            ));
        }
        Ok(Self {
            summary: summary.to_string(),
            commit_message: commit_message.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct CompleteTaskTool;

#[async_trait]
impl Tool for CompleteTaskTool {
    fn name(&self) -> &str {
        COMPLETE_TASK
    }

    fn description(&self) -> &str {
        "Signal that the task is finished and every acceptance criterion is met. \
         Your changes are committed with the given message. This is the only way \
         to finish; call it exactly once, last."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "What was done and how each criterion is satisfied"
                },
                "commit_message": {
                    "type": "string",
                    "description": "Commit message for the changes"
                }
            },
            "required": ["summary", "commit_message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let completion = Completion::from_params(&params)?;
        Ok(ToolOutput::success(
            serde_json::json!({
                "accepted": true,
                "summary": completion.summary,
            }),
            std::time::Duration::ZERO,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arguments() {
        let c = Completion::from_params(&serde_json::json!({
            "summary": " added tests ",
            "commit_message": "Add login tests"
        }))
        .unwrap();
        assert_eq!(c.summary, "added tests");
        assert_eq!(c.commit_message, "Add login tests");
    }

    #[test]
    fn empty_commit_message_is_rejected() {
        let err = Completion::from_params(&serde_json::json!({
            "summary": "x",
            "commit_message": "  "
        }))
        .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
