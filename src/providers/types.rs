//! Vendor-neutral message and completion types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::Provider;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,

    /// Tool call ID (for tool responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool name (for tool responses; Gemini matches results by name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Tool calls made by assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message with tool calls
    pub fn assistant_with_tools(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(Role::Tool, result)
        }
    }
}

/// A tool call request from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool the model may call, described by a JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-request options
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Model id; the adapter's configured default when `None`
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolDefinition>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: None,
            tools: Vec::new(),
        }
    }
}

impl CompletionOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Normalized completion result
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// Text content of the response
    pub content: Option<String>,

    /// Tool calls requested by the model
    pub tool_calls: Vec<ToolCallRequest>,

    /// Reason the response finished
    pub finish_reason: String,

    pub usage: Usage,

    pub model: String,
}

impl CompletionResponse {
    #[inline]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A model offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub provider: Provider,
}

/// Concatenated text of all system messages, if any
pub(crate) fn system_text(messages: &[Message]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_result_carries_id_and_name() {
        let msg = Message::tool_result("call_1", "read_file", "contents");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn test_system_text_joins_system_messages() {
        let messages = vec![
            Message::system("Be brief."),
            Message::user("hi"),
            Message::system("Answer in English."),
        ];
        assert_eq!(
            system_text(&messages).as_deref(),
            Some("Be brief.\n\nAnswer in English.")
        );
        assert_eq!(system_text(&[Message::user("hi")]), None);
    }
}
