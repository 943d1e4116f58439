//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::http::{build_http_client, check_status, transport_error};
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
    TokenUsage, ToolCall, ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(&self, body: &AnthropicRequest) -> Result<AnthropicResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", e))?;

        let response = check_status("anthropic", response).await?;
        response
            .json::<AnthropicResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                provider: "anthropic".to_string(),
                reason: e.to_string(),
            })
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> AnthropicRequest {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: convert_messages(messages),
            tools: tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
            temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Map chat history onto Anthropic's user/assistant alternation.
///
/// Tool results become `tool_result` blocks in a user message; consecutive
/// results are merged so they follow their `tool_use` turn directly.
fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {}
            Role::User => out.push(AnthropicMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: m.content.clone(),
                }],
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: m.content.clone(),
                    });
                }
                for tc in &m.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments.clone(),
                    });
                }
                out.push(AnthropicMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: m.content.clone(),
                };
                match out.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && last
                                .content
                                .iter()
                                .all(|b| matches!(b, ContentBlock::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }

    out
}

fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolUse,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn split_response(data: AnthropicResponse) -> ToolCompletionResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in data.content {
        match block.r#type.as_str() {
            "text" => {
                if let Some(t) = block.text {
                    text.push_str(&t);
                }
            }
            "tool_use" => {
                if let (Some(id), Some(name)) = (block.id, block.name) {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: block.input.unwrap_or(Value::Object(Default::default())),
                    });
                }
            }
            _ => {}
        }
    }

    ToolCompletionResponse {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: TokenUsage {
            input_tokens: data.usage.input_tokens,
            output_tokens: data.usage.output_tokens,
        },
        finish_reason: finish_reason(data.stop_reason.as_deref()),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model).unwrap_or_else(costs::default_cost)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_request(
            &request.messages,
            &[],
            request.max_tokens,
            request.temperature,
        );
        let response = split_response(self.send(&body).await?);
        Ok(CompletionResponse {
            content: response.content.unwrap_or_default(),
            usage: response.usage,
            finish_reason: response.finish_reason,
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let body = self.build_request(
            &request.messages,
            &request.tools,
            request.max_tokens,
            request.temperature,
        );
        let data = self.send(&body).await?;
        tracing::debug!(
            model = %self.model,
            input_tokens = data.usage.input_tokens,
            output_tokens = data.usage.output_tokens,
            "Anthropic completion"
        );
        Ok(split_response(data))
    }
}
