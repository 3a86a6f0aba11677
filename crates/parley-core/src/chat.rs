//! Conversation log shared by every LLM round of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The single answer recorded for a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// How much of an assistant reply was voiced before an interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    pub spoken_chars: usize,
    pub generated_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncation>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            is_error: false,
            truncated: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(ChatRole::Assistant, content)
        }
    }

    pub fn tool(result: ToolResult) -> Self {
        Self {
            tool_call_id: Some(result.call_id),
            name: Some(result.name),
            is_error: result.is_error,
            ..Self::new(ChatRole::Tool, result.content)
        }
    }
}

/// Ordered conversation log.
///
/// Append-only, except that an interrupted reply may be cut back to what was
/// voiced and [`ChatContext::trim_to`] may drop the oldest exchanges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    messages: Vec<ChatMessage>,
}

impl ChatContext {
    pub fn new(system_prompt: Option<&str>) -> Self {
        let messages = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(|p| vec![ChatMessage::system(p)])
            .unwrap_or_default();
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// The last conversational message is a user or tool message, so the
    /// model owes a reply.
    pub fn awaiting_reply(&self) -> bool {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role != ChatRole::System)
            .is_some_and(|m| matches!(m.role, ChatRole::User | ChatRole::Tool))
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Append a model reply. Refused unless a reply is owed.
    pub fn push_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Result<()> {
        if !self.awaiting_reply() {
            return Err(ParleyError::Protocol(
                "assistant message without a preceding user or tool message".into(),
            ));
        }
        self.messages.push(ChatMessage::assistant(content, tool_calls));
        Ok(())
    }

    /// Append an assistant utterance that was not prompted by the user.
    pub fn push_greeting(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(text, Vec::new()));
    }

    /// Append a tool result. The call must belong to an earlier assistant
    /// message and must not be answered yet.
    pub fn push_tool_result(&mut self, result: ToolResult) -> Result<()> {
        if !self.has_call(&result.call_id) {
            return Err(ParleyError::Protocol(format!(
                "tool result for unknown call {}",
                result.call_id
            )));
        }
        if self.is_resolved(&result.call_id) {
            return Err(ParleyError::Protocol(format!(
                "tool call {} already resolved",
                result.call_id
            )));
        }
        self.messages.push(ChatMessage::tool(result));
        Ok(())
    }

    pub fn is_resolved(&self, call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == ChatRole::Tool && m.tool_call_id.as_deref() == Some(call_id))
    }

    fn has_call(&self, call_id: &str) -> bool {
        self.messages
            .iter()
            .filter(|m| m.role == ChatRole::Assistant)
            .any(|m| m.tool_calls.iter().any(|c| c.id == call_id))
    }

    /// Cut the assistant messages at or after index `from` so that together
    /// they hold only the first `spoken_chars` characters of their combined
    /// content. Tool calls are kept. Returns the spoken characters left over
    /// once every message has been accounted for.
    pub fn truncate_reply(&mut self, from: usize, mut spoken_chars: usize) -> usize {
        for msg in self
            .messages
            .iter_mut()
            .skip(from)
            .filter(|m| m.role == ChatRole::Assistant)
        {
            let generated = msg.content.chars().count();
            if spoken_chars >= generated {
                spoken_chars -= generated;
                continue;
            }
            msg.content = msg.content.chars().take(spoken_chars).collect();
            msg.truncated = Some(Truncation {
                spoken_chars,
                generated_chars: generated,
            });
            spoken_chars = 0;
        }
        spoken_chars
    }

    /// Append the voiced prefix of a reply fragment that was never committed.
    pub fn push_truncated(&mut self, generated: &str, spoken_chars: usize) -> Result<()> {
        let generated_chars = generated.chars().count();
        let spoken_chars = spoken_chars.min(generated_chars);
        self.push_assistant(generated.chars().take(spoken_chars).collect::<String>(), Vec::new())?;
        if let Some(msg) = self.messages.last_mut() {
            msg.truncated = Some(Truncation {
                spoken_chars,
                generated_chars,
            });
        }
        Ok(())
    }

    /// Drop the oldest non-system messages until at most `max` remain. Tool
    /// results are never left without the assistant message that called them.
    pub fn trim_to(&mut self, max: usize) -> usize {
        let mut dropped = 0;
        while self.conversational_len() > max {
            let Some(idx) = self.first_conversational() else {
                break;
            };
            self.messages.remove(idx);
            dropped += 1;
            while let Some(idx) = self.first_conversational() {
                if self.messages[idx].role != ChatRole::Tool {
                    break;
                }
                self.messages.remove(idx);
                dropped += 1;
            }
        }
        dropped
    }

    fn conversational_len(&self) -> usize {
        self.messages.iter().filter(|m| m.role != ChatRole::System).count()
    }

    fn first_conversational(&self) -> Option<usize> {
        self.messages.iter().position(|m| m.role != ChatRole::System)
    }
}
