//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait to stream chat
//! completions with tool calling. The voice pipeline only ever talks to this
//! trait, so any backend can be swapped in without touching turn-taking.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use parley_core::chat::ChatMessage;
use parley_core::config::{Config, ProviderConfig};

pub mod failover;
pub mod openai;
pub mod sse;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// Local servers such as Ollama.
    #[serde(rename = "none")]
    None,
}

/// A request to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// Provider-formatted messages, system prompt included.
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub tools: Option<Vec<serde_json::Value>>,
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub tool_use: Option<ToolUseChunk>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

impl CompletionChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input_json: impl Into<String>) -> Self {
        Self {
            tool_use: Some(ToolUseChunk {
                id: id.into(),
                name: name.into(),
                input_json: input_json.into(),
            }),
            ..Self::default()
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn usage(input_tokens: Option<u64>, output_tokens: Option<u64>) -> Self {
        Self {
            usage: Some(ChunkUsage {
                input_tokens,
                output_tokens,
            }),
            ..Self::default()
        }
    }
}

/// A complete tool call. Arguments are raw JSON text as produced by the
/// model and may be malformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseChunk {
    pub id: String,
    pub name: String,
    pub input_json: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openai", "ollama").
    fn id(&self) -> &str;

    /// Convert tool definitions to the provider's wire format.
    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value>;

    /// Convert the chat context to the provider's wire format.
    fn format_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value>;

    /// Whether a stop reason means the model is waiting on tool results.
    fn is_tool_use_stop(&self, stop_reason: &str) -> bool;

    /// Stream a chat completion. Dropping the stream closes the connection.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream>;
}

/// Build a provider and its credentials from a single provider entry.
pub fn provider_from_config(pc: &ProviderConfig) -> anyhow::Result<(Arc<dyn LlmProvider>, Credentials)> {
    let base_url = pc.base_url.as_deref();
    let provider: Arc<dyn LlmProvider> = match pc.id.as_str() {
        "openai" => Arc::new(openai::OpenAiProvider::openai(base_url)),
        "openrouter" => Arc::new(openai::OpenAiProvider::openrouter(base_url)),
        "ollama" => Arc::new(openai::OpenAiProvider::ollama(base_url)),
        other => anyhow::bail!("Unknown LLM provider '{other}'"),
    };
    let credentials = match pc.resolve_api_key() {
        Some(api_key) => Credentials::ApiKey { api_key },
        None if pc.id == "ollama" => Credentials::None,
        None => anyhow::bail!("Provider '{}' has no API key configured", pc.id),
    };
    Ok((provider, credentials))
}

/// Build the configured LLM backend. Several providers are wrapped in a
/// [`failover::FailoverProvider`] in the configured order.
pub fn build_provider(config: &Config) -> anyhow::Result<(Arc<dyn LlmProvider>, Credentials)> {
    let mut built = config
        .providers()
        .iter()
        .map(provider_from_config)
        .collect::<anyhow::Result<Vec<_>>>()?;
    match built.len() {
        0 => anyhow::bail!("No LLM provider configured under models.providers"),
        1 => Ok(built.remove(0)),
        _ => {
            let label = built
                .iter()
                .map(|(p, _)| p.id().to_string())
                .collect::<Vec<_>>()
                .join("+");
            Ok((
                Arc::new(failover::FailoverProvider::new(label, built)),
                Credentials::None,
            ))
        }
    }
}
