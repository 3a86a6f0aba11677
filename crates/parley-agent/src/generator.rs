//! LLM turns with tool calls, streamed as text deltas.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use parley_core::chat::{ChatContext, ToolCall, ToolResult};
use parley_core::config::Config;
use parley_core::error::{ParleyError, Result};
use parley_providers::{CompletionRequest, Credentials, LlmProvider, ToolUseChunk};
use parley_tools::{ToolContext, ToolRegistry};

use crate::SharedChat;

/// Content recorded for tool calls left unanswered by an interruption.
pub const INTERRUPTED_TOOL_RESULT: &str = "cancelled: user interrupted";

/// What the current turn has produced beyond the committed chat messages.
#[derive(Debug, Default)]
pub struct ReplyProgress {
    /// Index of the first chat message written by this turn.
    pub turn_start: usize,
    /// Text streamed in the current round, not yet committed.
    pub pending: String,
    /// Committed tool calls still waiting for their result.
    pub unresolved: Vec<ToolCall>,
    /// Set once the turn's outcome is final in the chat.
    pub recorded: bool,
}

impl ReplyProgress {
    pub fn starting_at(turn_start: usize) -> Self {
        Self {
            turn_start,
            ..Self::default()
        }
    }
}

/// Record in `chat` how much of an interrupted turn was heard.
///
/// Committed assistant messages are cut to the first `spoken_chars`
/// characters, unanswered tool calls are resolved with a cancellation result
/// and the uncommitted tail of the reply is appended as a truncated message.
pub fn record_interruption(chat: &mut ChatContext, progress: &mut ReplyProgress, spoken_chars: usize) {
    if progress.recorded {
        return;
    }
    progress.recorded = true;

    let leftover = chat.truncate_reply(progress.turn_start, spoken_chars);
    for call in progress.unresolved.drain(..) {
        if chat.is_resolved(&call.id) {
            continue;
        }
        if let Err(e) = chat.push_tool_result(ToolResult::error(&call, INTERRUPTED_TOOL_RESULT)) {
            warn!(%e, call = %call.id, "Could not resolve interrupted tool call");
        }
    }
    let pending = std::mem::take(&mut progress.pending);
    if chat.awaiting_reply() {
        if let Err(e) = chat.push_truncated(&pending, leftover) {
            warn!(%e, "Could not record truncated reply");
        }
    }
}

/// Record an assistant utterance that was not prompted by the user.
pub fn record_utterance(chat: &mut ChatContext, text: &str) -> ReplyProgress {
    let progress = ReplyProgress::starting_at(chat.len());
    chat.push_greeting(text);
    progress
}

/// Streamed output of a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    ToolCall(ToolCall),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Completed { rounds: u32, tool_calls: u32 },
    Cancelled,
}

/// Shared state a single turn reads and writes.
pub struct ReplyTurn<'a> {
    pub session_id: &'a str,
    pub chat: &'a SharedChat,
    pub progress: &'a Mutex<ReplyProgress>,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    /// Rounds that may request tools; one more round is allowed to answer.
    pub max_tool_depth: u32,
    pub first_token_timeout: Duration,
    pub tool_timeout: Duration,
}

impl GeneratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let timeouts = config.voice().timeouts;
        Self {
            model: config.model(),
            max_tokens: config.max_tokens(),
            temperature: config.temperature(),
            max_tool_depth: config.max_tool_depth(),
            first_token_timeout: Duration::from_millis(timeouts.llm_first_token_timeout_ms),
            tool_timeout: Duration::from_millis(timeouts.tool_timeout_ms),
        }
    }
}

pub struct ResponseGenerator {
    provider: Arc<dyn LlmProvider>,
    credentials: Credentials,
    tools: Arc<ToolRegistry>,
    config: Arc<Config>,
    settings: GeneratorSettings,
}

impl ResponseGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        credentials: Credentials,
        tools: Arc<ToolRegistry>,
        config: Arc<Config>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            provider,
            credentials,
            tools,
            config,
            settings,
        }
    }

    /// Provider, built-in tools and settings from `config`.
    pub fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let (provider, credentials) = parley_providers::build_provider(&config)?;
        let mut tools = ToolRegistry::new();
        parley_tools::register_builtin_tools(&mut tools, &config);
        let settings = GeneratorSettings::from_config(&config);
        info!(provider = provider.id(), model = %settings.model, tools = ?tools.list(), "Response generator ready");
        Ok(Self::new(provider, credentials, Arc::new(tools), config, settings))
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Run one assistant turn against the chat.
    ///
    /// Text deltas and tool calls are passed to `on_delta` as they arrive.
    /// Each round's reply is committed to the chat once its stream ends;
    /// tool results are appended as they complete. On cancellation nothing
    /// further is committed and the partial round is left in `progress`.
    pub async fn generate<F>(&self, turn: ReplyTurn<'_>, mut on_delta: F) -> Result<GenerateOutcome>
    where
        F: FnMut(Delta) + Send,
    {
        if !turn.chat.lock().awaiting_reply() {
            return Err(ParleyError::Protocol("no user or tool message to reply to".into()));
        }

        let definitions = self.tools.definitions();
        let max_depth = self.settings.max_tool_depth;
        let mut tool_calls = 0;

        for round in 0..=max_depth {
            let offer_tools = round < max_depth && !definitions.is_empty();
            let request = {
                let chat = turn.chat.lock();
                CompletionRequest {
                    model: self.settings.model.clone(),
                    messages: self.provider.format_messages(chat.messages()),
                    max_tokens: self.settings.max_tokens,
                    temperature: self.settings.temperature,
                    tools: offer_tools.then(|| self.provider.format_tools(&definitions)),
                }
            };
            debug!(round, offer_tools, messages = request.messages.len(), "LLM round");

            let Some(calls) = self.stream_round(&request, &turn, &mut on_delta).await? else {
                return Ok(GenerateOutcome::Cancelled);
            };

            {
                let mut chat = turn.chat.lock();
                let mut progress = turn.progress.lock();
                if turn.cancel.is_cancelled() {
                    return Ok(GenerateOutcome::Cancelled);
                }
                let text = std::mem::take(&mut progress.pending);
                chat.push_assistant(text, calls.clone())?;
                progress.unresolved = calls.clone();
            }

            if calls.is_empty() {
                return Ok(GenerateOutcome::Completed {
                    rounds: round + 1,
                    tool_calls,
                });
            }

            for call in &calls {
                tool_calls += 1;
                let result = if round == max_depth {
                    warn!(tool = %call.name, depth = max_depth, "Tool call beyond depth limit");
                    ToolResult::error(call, format!("Tool call limit of {max_depth} rounds reached"))
                } else {
                    on_delta(Delta::ToolCall(call.clone()));
                    tokio::select! {
                        biased;
                        _ = turn.cancel.cancelled() => return Ok(GenerateOutcome::Cancelled),
                        result = self.run_tool(call, turn.session_id) => result,
                    }
                };

                let mut chat = turn.chat.lock();
                let mut progress = turn.progress.lock();
                if turn.cancel.is_cancelled() {
                    return Ok(GenerateOutcome::Cancelled);
                }
                chat.push_tool_result(result)?;
                progress.unresolved.retain(|c| c.id != call.id);
            }

            if round == max_depth {
                return Ok(GenerateOutcome::Completed {
                    rounds: round + 1,
                    tool_calls,
                });
            }
        }

        Ok(GenerateOutcome::Completed {
            rounds: max_depth + 1,
            tool_calls,
        })
    }

    /// Stream one LLM round. Returns the tool calls requested, or `None` if
    /// the turn was cancelled.
    async fn stream_round<F>(
        &self,
        request: &CompletionRequest,
        turn: &ReplyTurn<'_>,
        on_delta: &mut F,
    ) -> Result<Option<Vec<ToolCall>>>
    where
        F: FnMut(Delta) + Send,
    {
        let deadline = Instant::now() + self.settings.first_token_timeout;
        let no_first_token = || {
            ParleyError::Generation(format!(
                "no response from {} within {:?}",
                self.provider.id(),
                self.settings.first_token_timeout
            ))
        };

        let opened = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return Ok(None),
            opened = timeout_at(deadline, self.provider.stream(request, &self.credentials)) => opened,
        };
        let mut stream = match opened {
            Err(_) => return Err(no_first_token()),
            Ok(Err(e)) => return Err(ParleyError::Generation(e.to_string())),
            Ok(Ok(stream)) => stream,
        };

        let mut calls = Vec::new();
        let mut first = true;
        loop {
            let next = if first {
                tokio::select! {
                    biased;
                    _ = turn.cancel.cancelled() => return Ok(None),
                    next = timeout_at(deadline, stream.next()) => next.map_err(|_| no_first_token())?,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = turn.cancel.cancelled() => return Ok(None),
                    next = stream.next() => next,
                }
            };
            first = false;

            let chunk = match next {
                None => break,
                Some(Err(e)) => return Err(ParleyError::Generation(e.to_string())),
                Some(Ok(chunk)) => chunk,
            };
            if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
                turn.progress.lock().pending.push_str(&delta);
                on_delta(Delta::Text(delta));
            }
            if let Some(tool_use) = chunk.tool_use {
                calls.push(parse_tool_call(tool_use));
            }
            if let Some(usage) = chunk.usage {
                debug!(input_tokens = ?usage.input_tokens, output_tokens = ?usage.output_tokens, "Round usage");
            }
            if let Some(reason) = chunk.stop_reason {
                trace!(%reason, tool_use = self.provider.is_tool_use_stop(&reason), "Round finished");
            }
        }
        Ok(Some(calls))
    }

    /// Execute a tool call. Every failure becomes an error result the model
    /// can talk about.
    async fn run_tool(&self, call: &ToolCall, session_id: &str) -> ToolResult {
        let failure = |err: ParleyError| {
            warn!(tool = %call.name, kind = err.kind(), %err, "Tool call failed");
            ToolResult::error(call, err.to_string())
        };

        let Some(tool) = self.tools.get(&call.name) else {
            return failure(ParleyError::ToolInvocation(format!("Unknown tool: {}", call.name)));
        };
        if !call.arguments.is_object() {
            return failure(ParleyError::ToolInvocation(format!(
                "Invalid arguments for {}: expected a JSON object, got {}",
                call.name, call.arguments
            )));
        }

        let context = ToolContext {
            session_id: session_id.to_string(),
            config: Arc::clone(&self.config),
        };
        info!(tool = %call.name, "Executing tool");
        match timeout(self.settings.tool_timeout, tool.execute(call.arguments.clone(), &context)).await {
            Err(_) => failure(ParleyError::ToolInvocation(format!(
                "{} timed out after {:?}",
                call.name, self.settings.tool_timeout
            ))),
            Ok(Err(e)) => failure(ParleyError::ToolInvocation(format!("{} failed: {e}", call.name))),
            Ok(Ok(output)) if output.is_error => ToolResult::error(call, output.content),
            Ok(Ok(output)) => ToolResult::ok(call, output.content),
        }
    }
}

/// Arguments that are not valid JSON are kept as the raw string, so the call
/// still gets its (error) result.
fn parse_tool_call(tool_use: ToolUseChunk) -> ToolCall {
    let raw = tool_use.input_json.trim();
    let arguments = if raw.is_empty() {
        json!({})
    } else {
        serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
    };
    ToolCall {
        id: tool_use.id,
        name: tool_use.name,
        arguments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parley_core::chat::{ChatMessage, ChatRole};
    use parley_providers::{ChunkStream, CompletionChunk, ToolDefinition};
    use parley_tools::{Tool, ToolOutput};

    struct ScriptedLlm {
        rounds: Mutex<VecDeque<Vec<CompletionChunk>>>,
        requests: Mutex<Vec<CompletionRequest>>,
        stall_after: bool,
    }

    impl ScriptedLlm {
        fn new(rounds: Vec<Vec<CompletionChunk>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
                stall_after: false,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn id(&self) -> &str {
            "scripted"
        }
        fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
            tools.iter().map(|t| json!(t.name)).collect()
        }
        fn format_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
            messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect()
        }
        fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
            stop_reason == "tool_calls"
        }
        async fn stream(&self, request: &CompletionRequest, _credentials: &Credentials) -> anyhow::Result<ChunkStream> {
            self.requests.lock().push(request.clone());
            let Some(chunks) = self.rounds.lock().pop_front() else {
                anyhow::bail!("script exhausted");
            };
            let head = futures::stream::iter(chunks.into_iter().map(Ok));
            if self.stall_after {
                Ok(Box::pin(head.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }
    }

    struct Weather;

    #[async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "get_weather"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn description(&self) -> &str {
            "weather"
        }
        async fn execute(&self, params: serde_json::Value, _context: &ToolContext) -> anyhow::Result<ToolOutput> {
            match params["city"].as_str() {
                Some("Paris") => Ok(ToolOutput::ok(r#"{"temp":18,"condition":"cloudy"}"#)),
                Some("Slowtown") => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ToolOutput::ok("late"))
                }
                Some(_) => anyhow::bail!("service down"),
                None => Ok(ToolOutput::error("city is required")),
            }
        }
    }

    fn settings(max_tool_depth: u32) -> GeneratorSettings {
        GeneratorSettings {
            model: "test".into(),
            max_tokens: 64,
            temperature: None,
            max_tool_depth,
            first_token_timeout: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(2),
        }
    }

    fn generator(llm: Arc<ScriptedLlm>, depth: u32) -> ResponseGenerator {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(Weather));
        ResponseGenerator::new(
            llm,
            Credentials::None,
            Arc::new(tools),
            Arc::new(Config::default()),
            settings(depth),
        )
    }

    fn chat_with(user: &str) -> SharedChat {
        let mut chat = ChatContext::new(Some("You are a voice assistant."));
        chat.push_user(user);
        Arc::new(Mutex::new(chat))
    }

    async fn run(
        generator: &ResponseGenerator,
        chat: &SharedChat,
        progress: &Mutex<ReplyProgress>,
        cancel: &CancellationToken,
    ) -> (Result<GenerateOutcome>, Vec<Delta>) {
        let mut deltas = Vec::new();
        let outcome = generator
            .generate(
                ReplyTurn {
                    session_id: "test",
                    chat,
                    progress,
                    cancel,
                },
                |d| deltas.push(d),
            )
            .await;
        (outcome, deltas)
    }

    fn weather_call(args: &str) -> Vec<CompletionChunk> {
        vec![
            CompletionChunk::tool_use("call_1", "get_weather", args),
            CompletionChunk::stop("tool_calls"),
        ]
    }

    #[tokio::test]
    async fn test_text_reply_is_committed() {
        let llm = Arc::new(ScriptedLlm::new(vec![vec![
            CompletionChunk::text("Hello"),
            CompletionChunk::text(" there."),
            CompletionChunk::stop("stop"),
        ]]));
        let generator = generator(llm, 4);
        let chat = chat_with("hi");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, deltas) = run(&generator, &chat, &progress, &CancellationToken::new()).await;

        assert_eq!(outcome.unwrap(), GenerateOutcome::Completed { rounds: 1, tool_calls: 0 });
        assert_eq!(deltas, vec![Delta::Text("Hello".into()), Delta::Text(" there.".into())]);
        let chat = chat.lock();
        assert_eq!(chat.last().unwrap().content, "Hello there.");
        assert!(progress.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_trailing_usage_chunk_ends_round_cleanly() {
        let llm = Arc::new(ScriptedLlm::new(vec![vec![
            CompletionChunk::text("Hi."),
            CompletionChunk::stop("stop"),
            CompletionChunk::usage(Some(42), Some(3)),
        ]]));
        let generator = generator(llm, 4);
        let chat = chat_with("hi");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, deltas) = run(&generator, &chat, &progress, &CancellationToken::new()).await;

        assert_eq!(outcome.unwrap(), GenerateOutcome::Completed { rounds: 1, tool_calls: 0 });
        assert_eq!(deltas, vec![Delta::Text("Hi.".into())]);
        assert_eq!(chat.lock().last().unwrap().content, "Hi.");
    }

    #[tokio::test]
    async fn test_tool_result_feeds_next_round() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            weather_call(r#"{"city":"Paris"}"#),
            vec![CompletionChunk::text("It is 18 degrees and cloudy in Paris.")],
        ]));
        let generator = generator(llm.clone(), 4);
        let chat = chat_with("What's the weather in Paris");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, deltas) = run(&generator, &chat, &progress, &CancellationToken::new()).await;

        assert_eq!(outcome.unwrap(), GenerateOutcome::Completed { rounds: 2, tool_calls: 1 });
        assert!(matches!(&deltas[0], Delta::ToolCall(c) if c.arguments == json!({"city": "Paris"})));

        let chat = chat.lock();
        let roles: Vec<_> = chat.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
        assert!(chat.messages()[3].content.contains("18"));
        assert!(!chat.messages()[3].is_error);

        let requests = llm.requests.lock();
        assert_eq!(requests[1].messages.len(), 4);
        assert!(requests[0].tools.is_some());
    }

    #[tokio::test]
    async fn test_refuses_without_pending_user_message() {
        let generator = generator(Arc::new(ScriptedLlm::new(vec![])), 4);
        let chat = Arc::new(Mutex::new(ChatContext::new(None)));
        let progress = Mutex::new(ReplyProgress::default());
        let (outcome, _) = run(&generator, &chat, &progress, &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap_err().kind(), "protocol");
        assert!(chat.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tool_failures_become_error_results() {
        for (args, needle) in [
            (r#"{"city":"Atlantis"}"#, "service down"),
            (r#"{"city": "Par"#, "Invalid arguments"),
            (r#"{}"#, "city is required"),
        ] {
            let llm = Arc::new(ScriptedLlm::new(vec![
                weather_call(args),
                vec![CompletionChunk::text("Sorry, I could not check.")],
            ]));
            let generator = generator(llm, 4);
            let chat = chat_with("weather?");
            let progress = Mutex::new(ReplyProgress::starting_at(2));
            let (outcome, _) = run(&generator, &chat, &progress, &CancellationToken::new()).await;
            assert!(outcome.is_ok());
            let chat = chat.lock();
            let result = &chat.messages()[3];
            assert_eq!(result.role, ChatRole::Tool);
            assert!(result.is_error, "{args}");
            assert!(result.content.contains(needle), "{}", result.content);
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            vec![CompletionChunk::tool_use("c9", "launch_rocket", "{}")],
            vec![CompletionChunk::text("I can't do that.")],
        ]));
        let generator = generator(llm, 4);
        let chat = chat_with("launch");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        run(&generator, &chat, &progress, &CancellationToken::new()).await.0.unwrap();
        let chat = chat.lock();
        assert!(chat.messages()[3].content.contains("Unknown tool"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tool_times_out() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            weather_call(r#"{"city":"Slowtown"}"#),
            vec![CompletionChunk::text("The weather service is slow.")],
        ]));
        let generator = generator(llm, 4);
        let chat = chat_with("weather in Slowtown?");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        run(&generator, &chat, &progress, &CancellationToken::new()).await.0.unwrap();
        assert!(chat.lock().messages()[3].content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_depth_limit_withholds_tools_on_last_round() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            weather_call(r#"{"city":"Paris"}"#),
            vec![CompletionChunk::tool_use("call_2", "get_weather", r#"{"city":"Paris"}"#)],
        ]));
        let generator = generator(llm.clone(), 1);
        let chat = chat_with("weather twice");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, deltas) = run(&generator, &chat, &progress, &CancellationToken::new()).await;

        assert_eq!(outcome.unwrap(), GenerateOutcome::Completed { rounds: 2, tool_calls: 2 });
        assert_eq!(deltas.len(), 1);
        let requests = llm.requests.lock();
        assert!(requests[0].tools.is_some());
        assert!(requests[1].tools.is_none());
        let chat = chat.lock();
        let last = chat.last().unwrap();
        assert!(last.is_error);
        assert!(last.content.contains("limit"));
        assert!(chat.is_resolved("call_2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_token_timeout_is_generation_error() {
        let llm = Arc::new(ScriptedLlm {
            stall_after: true,
            ..ScriptedLlm::new(vec![vec![]])
        });
        let generator = generator(llm, 4);
        let chat = chat_with("hello?");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, _) = run(&generator, &chat, &progress, &CancellationToken::new()).await;
        assert!(matches!(outcome, Err(ParleyError::Generation(_))));
        assert_eq!(chat.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_is_generation_error() {
        let generator = generator(Arc::new(ScriptedLlm::new(vec![])), 4);
        let chat = chat_with("hello?");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let (outcome, _) = run(&generator, &chat, &progress, &CancellationToken::new()).await;
        assert_eq!(outcome.unwrap_err().kind(), "generation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_stream_leaves_partial_reply_pending() {
        let llm = Arc::new(ScriptedLlm {
            stall_after: true,
            ..ScriptedLlm::new(vec![vec![CompletionChunk::text("The weather in Paris is")]])
        });
        let generator = generator(llm, 4);
        let chat = chat_with("weather?");
        let progress = Mutex::new(ReplyProgress::starting_at(2));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let (outcome, _) = run(&generator, &chat, &progress, &cancel).await;
        assert_eq!(outcome.unwrap(), GenerateOutcome::Cancelled);
        assert_eq!(chat.lock().len(), 2);

        let mut chat = chat.lock();
        let mut progress = progress.lock();
        assert_eq!(progress.pending, "The weather in Paris is");
        record_interruption(&mut chat, &mut progress, 18);
        let last = chat.last().unwrap();
        assert_eq!(last.content, "The weather in Par");
        assert_eq!(last.truncated.unwrap().generated_chars, 23);
    }

    #[test]
    fn test_interruption_resolves_unanswered_calls() {
        let call = ToolCall {
            id: "c1".into(),
            name: "get_weather".into(),
            arguments: json!({"city": "Paris"}),
        };
        let mut chat = ChatContext::new(None);
        chat.push_user("weather?");
        let mut progress = ReplyProgress::starting_at(chat.len());
        chat.push_assistant("Let me check. ", vec![call.clone()]).unwrap();
        progress.unresolved.push(call);

        record_interruption(&mut chat, &mut progress, 4);
        let roles: Vec<_> = chat.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::User, ChatRole::Assistant, ChatRole::Tool, ChatRole::Assistant]
        );
        assert_eq!(chat.messages()[1].content, "Let ");
        assert_eq!(chat.messages()[2].content, INTERRUPTED_TOOL_RESULT);
        assert_eq!(chat.messages()[3].content, "");
        assert!(chat.messages()[3].truncated.is_some());

        // a second report for the same turn changes nothing
        record_interruption(&mut chat, &mut progress, 0);
        assert_eq!(chat.len(), 4);
    }

    #[test]
    fn test_utterance_is_recorded_for_truncation() {
        let mut chat = ChatContext::new(Some("sys"));
        let mut progress = record_utterance(&mut chat, "How can I help you today?");
        record_interruption(&mut chat, &mut progress, 7);
        assert_eq!(chat.last().unwrap().content, "How can");
        assert_eq!(chat.len(), 2);
    }

    #[test]
    fn test_parse_tool_call_keeps_raw_on_bad_json() {
        let call = parse_tool_call(ToolUseChunk {
            id: "c".into(),
            name: "get_weather".into(),
            input_json: "{\"city\":".into(),
        });
        assert_eq!(call.arguments, json!("{\"city\":"));
        let empty = parse_tool_call(ToolUseChunk {
            id: "c".into(),
            name: "get_weather".into(),
            input_json: "  ".into(),
        });
        assert_eq!(empty.arguments, json!({}));
    }
}
