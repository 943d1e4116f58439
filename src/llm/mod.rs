//! LLM integration for ai-taskd.
//!
//! Supports:
//! - **Anthropic**: Messages API with `tool_use` / `tool_result` blocks
//! - **OpenAI-compatible**: `/chat/completions` with function tools
//!
//! Both providers talk HTTP through `reqwest` and implement `LlmProvider`.

pub mod anthropic;
mod costs;
mod http;
pub mod openai;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" | "openai_compatible" | "openai-compatible" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM provider '{other}'")),
        }
    }
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => {
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| anthropic::DEFAULT_MODEL.to_string());
            let mut provider = AnthropicProvider::new(config.api_key.clone(), &model);
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using Anthropic (model: {})", model);
            Ok(Arc::new(provider))
        }
        LlmBackend::OpenAi => {
            let model = config
                .model
                .clone()
                .unwrap_or_else(|| openai::DEFAULT_MODEL.to_string());
            let mut provider = OpenAiProvider::new(config.api_key.clone(), &model);
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using OpenAI-compatible API (model: {})", model);
            Ok(Arc::new(provider))
        }
    }
}
