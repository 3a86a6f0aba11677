//! OpenAI Chat Completions API provider.
//!
//! Implements streaming chat completions via `/v1/chat/completions`.
//! Also serves OpenRouter, Ollama, and other OpenAI-compatible servers.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::chat::{ChatMessage, ChatRole};

use crate::sse::{SseEvent, parse_sse_response};
use crate::{
    ChunkStream, ChunkUsage, CompletionChunk, CompletionRequest, Credentials, LlmProvider,
    ToolDefinition,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style. Determines minor behavior differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    fn with_style(base_url: Option<&str>, default_url: &str, api_style: ApiStyle, id: &str) -> Self {
        Self {
            base_url: base_url.unwrap_or(default_url).trim_end_matches('/').to_string(),
            api_style,
            provider_id: id.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENAI_BASE_URL, ApiStyle::OpenAi, "openai")
    }

    pub fn openrouter(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OPENROUTER_BASE_URL, ApiStyle::OpenRouter, "openrouter")
    }

    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::with_style(base_url, OLLAMA_BASE_URL, ApiStyle::Ollama, "ollama")
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [serde_json::Value],
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Accumulates tool call data across streaming deltas.
#[derive(Debug, Clone, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect()
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .filter_map(|msg| match msg.role {
                ChatRole::System => Some(json!({ "role": "system", "content": msg.content })),
                ChatRole::User => Some(json!({ "role": "user", "content": msg.content })),
                ChatRole::Assistant => {
                    let mut out = json!({ "role": "assistant" });
                    if !msg.content.is_empty() {
                        out["content"] = json!(msg.content);
                    }
                    if !msg.tool_calls.is_empty() {
                        let calls: Vec<_> = msg
                            .tool_calls
                            .iter()
                            .map(|c| {
                                json!({
                                    "id": c.id,
                                    "type": "function",
                                    "function": {
                                        "name": c.name,
                                        "arguments": c.arguments.to_string(),
                                    }
                                })
                            })
                            .collect();
                        out["tool_calls"] = json!(calls);
                    }
                    // an interruption can cut a reply down to nothing
                    (out.get("content").is_some() || out.get("tool_calls").is_some()).then_some(out)
                }
                ChatRole::Tool => Some(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id,
                    "content": msg.content,
                })),
            })
            .collect()
    }

    fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
        stop_reason == "tool_calls"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let api_key = match credentials {
            Credentials::ApiKey { api_key } => Some(api_key.as_str()),
            Credentials::None if self.api_style == ApiStyle::Ollama => None,
            Credentials::None => anyhow::bail!("{} requires an API key", self.provider_id),
        };

        let body = OpenAiRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            tools: request.tools.as_deref().filter(|t| !t.is_empty()),
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(key) = api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }
        if self.api_style == ApiStyle::OpenRouter {
            req_builder = req_builder.header("X-Title", "Parley");
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        Ok(Box::pin(chunk_stream(parse_sse_response(response))))
    }
}

struct OpenAiChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    tool_calls: Vec<ToolCallAccumulator>,
    pending: VecDeque<CompletionChunk>,
    done: bool,
}

impl OpenAiChunkState {
    /// Queue every accumulated tool call, the last one carrying `stop_reason`.
    fn flush_tool_calls(&mut self, stop_reason: Option<String>) {
        let count = self.tool_calls.len();
        for (i, tc) in self.tool_calls.drain(..).enumerate() {
            let mut chunk = CompletionChunk::tool_use(tc.id, tc.name, tc.arguments);
            if i + 1 == count {
                chunk.stop_reason = stop_reason.clone();
            }
            self.pending.push_back(chunk);
        }
        if count == 0 {
            if let Some(reason) = stop_reason {
                self.pending.push_back(CompletionChunk::stop(reason));
            }
        }
    }

    fn absorb(&mut self, chunk: ChatCompletionChunk) {
        if let Some(usage) = chunk.usage {
            self.pending.push_back(CompletionChunk {
                usage: Some(ChunkUsage {
                    input_tokens: Some(usage.prompt_tokens),
                    output_tokens: Some(usage.completion_tokens),
                }),
                ..CompletionChunk::default()
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            if self.tool_calls.len() <= tc.index {
                self.tool_calls.resize_with(tc.index + 1, ToolCallAccumulator::default);
            }
            let acc = &mut self.tool_calls[tc.index];
            if let Some(id) = tc.id {
                acc.id = id;
            }
            if let Some(f) = tc.function {
                if let Some(name) = f.name {
                    acc.name = name;
                }
                if let Some(args) = f.arguments {
                    acc.arguments.push_str(&args);
                }
            }
        }

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.pending.push_back(CompletionChunk::text(content));
        }

        if let Some(reason) = choice.finish_reason {
            self.flush_tool_calls(Some(reason));
        }
    }
}

/// Decode OpenAI SSE events into completion chunks.
fn chunk_stream<S>(sse: S) -> impl Stream<Item = anyhow::Result<CompletionChunk>> + Send
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    futures::stream::unfold(
        OpenAiChunkState {
            sse: Box::pin(sse),
            tool_calls: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.sse.next().await {
                    Some(Ok(event)) => {
                        let data = event.data.trim();
                        // OpenAI terminates with "data: [DONE]"
                        if data == "[DONE]" {
                            state.flush_tool_calls(None);
                            state.done = true;
                            continue;
                        }
                        match serde_json::from_str::<ChatCompletionChunk>(data) {
                            Ok(chunk) => state.absorb(chunk),
                            Err(e) => trace!(%e, data, "Failed to parse OpenAI chunk"),
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        state.flush_tool_calls(None);
                        state.done = true;
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::chat::{ChatContext, ToolCall, ToolResult};

    fn sse(data: &[&str]) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send + 'static {
        let events: Vec<anyhow::Result<SseEvent>> = data
            .iter()
            .map(|d| {
                Ok(SseEvent {
                    event: None,
                    data: d.to_string(),
                })
            })
            .collect();
        futures::stream::iter(events)
    }

    async fn collect(data: &[&str]) -> Vec<CompletionChunk> {
        let stream = chunk_stream(sse(data));
        let chunks: Vec<anyhow::Result<CompletionChunk>> = Box::pin(stream).collect().await;
        chunks.into_iter().map(|c| c.unwrap()).collect()
    }

    #[test]
    fn test_provider_creation() {
        assert_eq!(OpenAiProvider::openai(None).base_url, OPENAI_BASE_URL);
        assert_eq!(OpenAiProvider::openrouter(None).id(), "openrouter");
        assert_eq!(OpenAiProvider::ollama(None).base_url, OLLAMA_BASE_URL);
        let custom = OpenAiProvider::openai(Some("https://my-proxy.example.com/"));
        assert_eq!(custom.base_url, "https://my-proxy.example.com");
    }

    #[test]
    fn test_format_tools_function_wrapper() {
        let provider = OpenAiProvider::openai(None);
        let tools = vec![ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": { "city": { "type": "string" } },
            }),
        }];
        let formatted = provider.format_tools(&tools);
        assert_eq!(formatted[0]["type"], "function");
        assert_eq!(formatted[0]["function"]["name"], "get_weather");
        assert!(formatted[0]["function"]["parameters"].is_object());
    }

    #[test]
    fn test_is_tool_use_stop() {
        let provider = OpenAiProvider::openai(None);
        assert!(provider.is_tool_use_stop("tool_calls"));
        assert!(!provider.is_tool_use_stop("stop"));
    }

    #[test]
    fn test_format_messages_with_tools() {
        let provider = OpenAiProvider::openai(None);
        let call = ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: json!({"city": "Paris"}),
        };
        let mut ctx = ChatContext::new(Some("You are a voice assistant."));
        ctx.push_user("What's the weather in Paris");
        ctx.push_assistant("", vec![call.clone()]).unwrap();
        ctx.push_tool_result(ToolResult::ok(&call, r#"{"temp":18}"#)).unwrap();

        let messages = provider.format_messages(ctx.messages());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[2].get("content").is_none());
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"city":"Paris"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_format_messages_skips_empty_truncated_reply() {
        let provider = OpenAiProvider::openai(None);
        let mut ctx = ChatContext::new(None);
        ctx.push_user("hi");
        ctx.push_truncated("Hello there", 0).unwrap();
        let messages = provider.format_messages(ctx.messages());
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_text_stream() {
        let chunks = collect(&[
            r#"{"choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            r#"{"choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ])
        .await;
        let text: String = chunks.iter().filter_map(|c| c.delta.clone()).collect();
        assert_eq!(text, "Hello");
        assert_eq!(chunks.last().unwrap().stop_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_parallel_tool_calls_all_emitted() {
        let chunks = collect(&[
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"get_weather","arguments":"{\"ci"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\":\"Paris\"}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"get_weather","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#,
            "[DONE]",
        ])
        .await;
        let tools: Vec<_> = chunks.iter().filter_map(|c| c.tool_use.clone()).collect();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].id, "call_a");
        assert_eq!(tools[0].input_json, r#"{"city":"Paris"}"#);
        assert_eq!(tools[1].id, "call_b");
        let stop = chunks.iter().find_map(|c| c.stop_reason.clone());
        assert_eq!(stop.as_deref(), Some("tool_calls"));
        assert!(chunks.iter().any(|c| c.usage.is_some()));
    }

    #[tokio::test]
    async fn test_unparseable_chunk_is_skipped() {
        let chunks = collect(&[
            "not json",
            r#"{"choices":[{"index":0,"delta":{"content":"ok"},"finish_reason":"stop"}]}"#,
        ])
        .await;
        assert_eq!(chunks[0].delta.as_deref(), Some("ok"));
    }
}
