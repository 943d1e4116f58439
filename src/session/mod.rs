//! Tool-execution session: a bounded multi-turn loop between the orchestrator
//! and a tool-calling model, ending only on `complete_task`.
//!
//! Each turn sends the conversation plus tool definitions, executes any tool
//! calls in order, and appends their results. Tool errors go back to the
//! model as data. Any failed session, including one that runs out of turns,
//! commits nothing and has its working-tree changes discarded.

pub mod commit;

pub use commit::{Committer, GitCommitter};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::SessionError;
use crate::llm::{ChatMessage, LlmProvider, TokenUsage, ToolCompletionRequest};
use crate::tasks::Task;
use crate::tools::builtin::{COMPLETE_TASK, Completion, session_registry};
use crate::tools::{ToolContext, ToolRegistry};

pub const DEFAULT_MAX_TURNS: u32 = 20;

const TEXT_ONLY_REMINDER: &str = "Continue working with the tools. When every acceptance \
     criterion is met, call complete_task with a summary and a commit message.";

/// Session limits and sandbox root.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_turns: u32,
    pub workdir: PathBuf,
    pub command_timeout: Duration,
}

impl SessionConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            workdir: workdir.into(),
            command_timeout: crate::tools::builtin::shell::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// What a completed session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub summary: String,
    pub commit_message: String,
    /// Commit id, or `None` when the session changed nothing.
    pub commit_ref: Option<String>,
    pub turns: u32,
    pub usage: TokenUsage,
    pub cost: Decimal,
}

pub struct ToolSession {
    llm: Arc<dyn LlmProvider>,
    committer: Arc<dyn Committer>,
    tools: ToolRegistry,
    config: SessionConfig,
}

impl ToolSession {
    /// Session with the standard file, shell and completion tools.
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        committer: Arc<dyn Committer>,
        config: SessionConfig,
    ) -> Self {
        let tools = session_registry(&config.workdir, config.command_timeout);
        Self {
            llm,
            committer,
            tools,
            config,
        }
    }

    /// Replace the tool set. `complete_task` must remain registered.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Drive the session for one task.
    pub async fn run(&self, task: &Task) -> Result<SessionOutcome, SessionError> {
        let result = self.drive(task).await;
        if result.is_err()
            && let Err(e) = self.committer.discard().await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to discard session changes");
        }
        result
    }

    async fn drive(&self, task: &Task) -> Result<SessionOutcome, SessionError> {
        let ctx = ToolContext::for_task(&task.id);
        let definitions = self.tools.tool_definitions();
        let mut messages = vec![
            ChatMessage::system(system_prompt(&self.config.workdir)),
            ChatMessage::user(task_prompt(task)),
        ];
        let mut usage = TokenUsage::default();

        for turn in 1..=self.config.max_turns {
            let request = ToolCompletionRequest::new(messages.clone(), definitions.clone());
            let response = self.llm.complete_with_tools(request).await?;
            usage.add(response.usage);

            if response.tool_calls.is_empty() {
                tracing::debug!(task_id = %task.id, turn, "Text-only turn, reminding model");
                messages.push(ChatMessage::assistant(
                    response.content.unwrap_or_default(),
                ));
                messages.push(ChatMessage::user(TEXT_ONLY_REMINDER));
                continue;
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content,
                response.tool_calls.clone(),
            ));

            let mut completion = None;
            for call in &response.tool_calls {
                if call.name == COMPLETE_TASK {
                    match Completion::from_params(&call.arguments) {
                        Ok(c) => {
                            completion = Some(c);
                            break;
                        }
                        Err(e) => {
                            messages.push(ChatMessage::tool_result(
                                &call.id,
                                &call.name,
                                format!("Error: {e}"),
                            ));
                            continue;
                        }
                    }
                }

                let content = match self
                    .tools
                    .execute(&call.name, call.arguments.clone(), &ctx)
                    .await
                {
                    Ok(output) => output.to_llm_string(),
                    Err(e) => {
                        tracing::debug!(task_id = %task.id, tool = %call.name, error = %e, "Tool call failed");
                        format!("Error: {e}")
                    }
                };
                messages.push(ChatMessage::tool_result(&call.id, &call.name, content));
            }

            if let Some(completion) = completion {
                let commit_ref = self.committer.commit(&completion.commit_message).await?;
                let cost = usage.cost(self.llm.cost_per_token());
                tracing::info!(
                    task_id = %task.id,
                    turns = turn,
                    tokens = usage.total(),
                    commit = commit_ref.as_deref().unwrap_or("-"),
                    "Session completed"
                );
                return Ok(SessionOutcome {
                    summary: completion.summary,
                    commit_message: completion.commit_message,
                    commit_ref,
                    turns: turn,
                    usage,
                    cost,
                });
            }
        }

        tracing::warn!(
            task_id = %task.id,
            max_turns = self.config.max_turns,
            "Session exhausted its turn budget"
        );
        Err(SessionError::BudgetExceeded {
            turns: self.config.max_turns,
        })
    }
}

fn system_prompt(workdir: &std::path::Path) -> String {
    format!(
        "You are completing a software task inside the repository at {}. \
         All paths are relative to that directory. Use read_file, write_file, \
         edit_file and run_command to do the work. When every acceptance \
         criterion is met, call complete_task exactly once.",
        workdir.display()
    )
}

fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.title);
    if !task.description.is_empty() {
        prompt.push('\n');
        prompt.push_str(&task.description);
        prompt.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }
    prompt
}
