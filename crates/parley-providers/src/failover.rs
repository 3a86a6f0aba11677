//! Failover provider: wraps multiple providers in priority order.
//!
//! If opening a stream fails (rate limit, auth failure, connection error),
//! the next provider in the list is tried. Errors after the stream has
//! started are not retried, since part of the reply may already be spoken.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use parley_core::chat::ChatMessage;

use crate::{ChunkStream, CompletionRequest, Credentials, LlmProvider, ToolDefinition};

/// A failover provider that tries multiple underlying providers in order.
pub struct FailoverProvider {
    providers: Vec<(Arc<dyn LlmProvider>, Credentials)>,
    label: String,
}

impl FailoverProvider {
    /// The first provider is primary; others are fallbacks.
    pub fn new(label: String, providers: Vec<(Arc<dyn LlmProvider>, Credentials)>) -> Self {
        Self { providers, label }
    }

    fn primary(&self) -> Option<&(Arc<dyn LlmProvider>, Credentials)> {
        self.providers.first()
    }
}

#[async_trait]
impl LlmProvider for FailoverProvider {
    fn id(&self) -> &str {
        &self.label
    }

    fn format_tools(&self, tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        self.primary()
            .map(|(p, _)| p.format_tools(tools))
            .unwrap_or_default()
    }

    fn format_messages(&self, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        self.primary()
            .map(|(p, _)| p.format_messages(messages))
            .unwrap_or_default()
    }

    fn is_tool_use_stop(&self, stop_reason: &str) -> bool {
        self.primary()
            .is_some_and(|(p, _)| p.is_tool_use_stop(stop_reason))
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        _credentials: &Credentials,
    ) -> anyhow::Result<ChunkStream> {
        let mut last_error = None;

        for (i, (provider, creds)) in self.providers.iter().enumerate() {
            match provider.stream(request, creds).await {
                Ok(stream) => {
                    if i > 0 {
                        info!(provider = provider.id(), attempt = i + 1, "Failover succeeded");
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(provider = provider.id(), attempt = i + 1, %e, "Provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No providers configured in failover")))
    }
}
