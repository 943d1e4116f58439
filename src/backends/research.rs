//! Single-completion backend: the model answers the task directly, no tools.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{Backend, BackendInfo, BackendResult, ExecutionRequest, Findings, ResultStatus};
use crate::error::BackendError;
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const SUMMARY_CHARS: usize = 280;

const SYSTEM_PROMPT: &str = "You are a research assistant. Answer the task \
     thoroughly and address every acceptance criterion explicitly.";

pub struct ResearchBackend {
    info: BackendInfo,
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl ResearchBackend {
    pub fn new(info: BackendInfo, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            info,
            llm,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl Backend for ResearchBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, BackendError> {
        let started = Instant::now();
        let task = &request.task;

        let mut prompt = format!("{}\n\n{}", task.title, task.description);
        if !task.acceptance_criteria.is_empty() {
            prompt.push_str("\n\nAcceptance criteria:");
            for criterion in &task.acceptance_criteria {
                prompt.push_str("\n- ");
                prompt.push_str(criterion);
            }
        }

        let response = self
            .llm
            .complete(
                CompletionRequest::new(vec![
                    ChatMessage::system(SYSTEM_PROMPT),
                    ChatMessage::user(prompt),
                ])
                .with_max_tokens(self.max_tokens),
            )
            .await
            .map_err(|e| BackendError::execution(&self.info.name, e.to_string()))?;

        let answer = response.content.trim().to_string();
        if answer.is_empty() {
            return Err(BackendError::execution(&self.info.name, "empty answer"));
        }

        // A truncated answer may miss criteria.
        let confidence = match response.finish_reason {
            FinishReason::Stop => 0.7,
            FinishReason::Length => 0.4,
            _ => 0.5,
        };

        Ok(BackendResult {
            backend: self.info.name.clone(),
            status: ResultStatus::Success,
            summary: summarize(&answer),
            findings: Findings::Research {
                answer,
                model: self.llm.model_name().to_string(),
            },
            cost_estimate: response.usage.cost(self.llm.cost_per_token()),
            duration_seconds: started.elapsed().as_secs_f64(),
            confidence,
            artifact_ref: None,
        })
    }
}

fn summarize(answer: &str) -> String {
    let first = answer.lines().next().unwrap_or_default();
    if first.chars().count() <= SUMMARY_CHARS {
        first.to_string()
    } else {
        format!("{}...", first.chars().take(SUMMARY_CHARS).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{CompletionResponse, TokenUsage, ToolCompletionRequest, ToolCompletionResponse};
    use crate::tasks::NewTask;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct Answers {
        text: String,
        seen: Mutex<Option<String>>,
    }

    #[async_trait]
    impl LlmProvider for Answers {
        fn model_name(&self) -> &str {
            "answers"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.001), dec!(0.003))
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            *self.seen.lock().unwrap() = Some(request.messages[1].content.clone());
            Ok(CompletionResponse {
                content: self.text.clone(),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 10,
                },
                finish_reason: FinishReason::Stop,
            })
        }

        async fn complete_with_tools(
            &self,
            _: ToolCompletionRequest,
        ) -> Result<ToolCompletionResponse, LlmError> {
            unreachable!()
        }
    }

    fn backend(text: &str) -> (ResearchBackend, Arc<Answers>) {
        let llm = Arc::new(Answers {
            text: text.into(),
            seen: Mutex::new(None),
        });
        (ResearchBackend::new(BackendInfo::new("research"), llm.clone()), llm)
    }

    #[tokio::test]
    async fn answers_and_prices_the_call() {
        let (backend, llm) = backend("Use a B-tree.\nDetails follow.");
        let task = NewTask::new("R1", "Pick an index")
            .with_criterion("justify choice")
            .into_task(Utc::now());

        let result = backend.execute(&ExecutionRequest::new(task)).await.unwrap();
        assert_eq!(result.summary, "Use a B-tree.");
        assert_eq!(result.cost_estimate, dec!(0.13));
        assert!(matches!(result.findings, Findings::Research { ref model, .. } if model == "answers"));
        assert!(llm.seen.lock().unwrap().as_deref().unwrap().contains("- justify choice"));
    }

    #[tokio::test]
    async fn empty_answer_is_a_backend_error() {
        let (backend, _) = backend("   ");
        let task = NewTask::new("R1", "x").into_task(Utc::now());
        assert!(backend.execute(&ExecutionRequest::new(task)).await.is_err());
    }
}
