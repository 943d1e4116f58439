//! OpenAI-compatible chat completions provider.
//!
//! Works against any server that speaks the `/chat/completions` dialect
//! (OpenAI, OpenRouter, local inference servers) via `base_url`.

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

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

pub struct OpenAiProvider {
    client: Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: build_http_client(),
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Set custom base URL (for API-compatible services).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(&self, body: &OpenAiRequest) -> Result<OpenAiResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("openai", e))?;

        let response = check_status("openai", response).await?;
        response
            .json::<OpenAiResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                provider: "openai".to_string(),
                reason: e.to_string(),
            })
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> OpenAiRequest {
        OpenAiRequest {
            model: self.model.clone(),
            messages: messages.iter().map(convert_message).collect(),
            tools: tools
                .iter()
                .map(|t| OpenAiTool {
                    r#type: "function",
                    function: OpenAiFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
            max_tokens,
            temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OpenAiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    /// JSON-encoded arguments, as the API transmits them.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn convert_message(m: &ChatMessage) -> OpenAiMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls: Vec<OpenAiToolCall> = m
        .tool_calls
        .iter()
        .map(|tc| OpenAiToolCall {
            id: tc.id.clone(),
            r#type: function_type(),
            function: OpenAiFunctionCall {
                name: tc.name.clone(),
                arguments: tc.arguments.to_string(),
            },
        })
        .collect();

    // Assistant turns that only call tools carry a null content.
    let content = if !tool_calls.is_empty() && m.content.is_empty() {
        None
    } else {
        Some(m.content.clone())
    };

    OpenAiMessage {
        role: role.to_string(),
        content,
        tool_call_id: m.tool_call_id.clone(),
        tool_calls,
    }
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn split_response(data: OpenAiResponse) -> Result<ToolCompletionResponse, LlmError> {
    let usage = data
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let choice = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: "openai".to_string(),
            reason: "response contained no choices".to_string(),
        })?;

    let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
    for tc in choice.message.tool_calls {
        let arguments = if tc.function.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&tc.function.arguments).map_err(|e| {
                LlmError::InvalidResponse {
                    provider: "openai".to_string(),
                    reason: format!("arguments for {} are not JSON: {e}", tc.function.name),
                }
            })?
        };
        tool_calls.push(ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments,
        });
    }

    Ok(ToolCompletionResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        usage,
        finish_reason: finish_reason(choice.finish_reason.as_deref()),
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        let response = split_response(self.send(&body).await?)?;
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
        let response = split_response(self.send(&body).await?)?;
        tracing::debug!(
            model = %self.model,
            tool_calls = response.tool_calls.len(),
            "OpenAI-compatible completion"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_arguments_are_json_encoded() {
        let msg = ChatMessage::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                id: "c1".into(),
                name: "run_command".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        let wire = serde_json::to_value(convert_message(&msg)).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
    }

    #[test]
    fn tool_result_keeps_call_id() {
        let wire = serde_json::to_value(convert_message(&ChatMessage::tool_result(
            "c1", "run_command", "ok",
        )))
        .unwrap();
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
    }

    #[test]
    fn response_parses_tool_calls() {
        let data: OpenAiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"path\":\"src/lib.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 50, "completion_tokens": 10}
        }))
        .unwrap();

        let response = split_response(data).unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls[0].arguments["path"], "src/lib.rs");
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 50);
    }

    #[test]
    fn empty_choices_is_invalid() {
        let data: OpenAiResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(matches!(
            split_response(data),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn malformed_tool_arguments_are_invalid() {
        let data: OpenAiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "write_file", "arguments": "{\"path\": "}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        match split_response(data) {
            Err(LlmError::InvalidResponse { reason, .. }) => assert!(reason.contains("write_file")),
            other => panic!("expected invalid response, got {other:?}"),
        }
    }
}
