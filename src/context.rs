//! LLM conversation context: messages, tools, and merge rules.
//!
//! [`LlmContext`] is the conversation state carried by `llm.context` frames.
//! It is mutable-by-replacement: processors clone it, append, and emit the
//! new value. Tool handlers ride along behind `Arc` so clones stay cheap and
//! the handler never reaches the provider wire.

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// The role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) output.
    Assistant,
    /// Tool execution result.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One part of a multi-part message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image reference.
    Image {
        /// URL (or data URL) of the image.
        image_url: String,
    },
}

/// Message content: a plain string or a sequence of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain string content.
    Text(String),
    /// Multi-part content.
    Parts(Vec<ContentPart>),
}

impl Content {
    /// The plain string, if this is string content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Parts(_) => None,
        }
    }
}

/// The function half of an assistant tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCallFunction {
    /// The function name.
    pub name: String,
    /// JSON-encoded arguments string, kept opaque until invocation.
    pub arguments: String,
}

/// An assistant-initiated tool call carried on an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub id: String,
    /// Always `"function"` on the wire.
    #[serde(rename = "type")]
    pub call_type: &'static str,
    /// The function being called.
    pub function: ToolCallFunction,
}

impl ToolCall {
    /// Create a function tool call.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function",
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Who sent this message.
    pub role: Role,
    /// The message content.
    pub content: Content,
    /// Tool calls requested by the assistant.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool-result messages, the call this result answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// A plain text message with the given role.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// A user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// An assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// An assistant message carrying tool calls and no text.
    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(String::new()),
            tool_calls: calls,
            tool_call_id: None,
        }
    }

    /// A tool-result message answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Content::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }

    /// Whether this message can merge with a same-role neighbor: plain
    /// string content and no tool linkage on either side.
    fn is_plain_text(&self) -> bool {
        self.tool_calls.is_empty()
            && self.tool_call_id.is_none()
            && matches!(self.content, Content::Text(_))
    }
}

/// An async tool handler. Synchronous handlers simply return immediately.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool with parsed JSON arguments.
    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// A function tool the LLM may invoke.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Wire-visible function name.
    pub name: String,
    /// Wire-visible description.
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: serde_json::Value,
    /// Provider strict-mode flag.
    pub strict: Option<bool>,
    /// The local implementation; never serialized.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("strict", &self.strict)
            .finish()
    }
}

/// The conversation state driving the LLM.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    /// Ordered message history.
    pub messages: Vec<Message>,
    /// Function tools available to the model.
    pub tools: Vec<ToolDefinition>,
}

impl LlmContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context seeded with the given messages.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
        }
    }

    /// Append a message, merging consecutive same-role plain-string
    /// messages by concatenation with a separating space.
    pub fn append_message(&mut self, message: Message) {
        if let Some(last) = self.messages.last_mut()
            && last.role == message.role
            && last.is_plain_text()
            && message.is_plain_text()
            && let (Content::Text(prev), Content::Text(next)) = (&mut last.content, &message.content)
        {
            if !prev.is_empty() && !next.is_empty() {
                prev.push(' ');
            }
            prev.push_str(next);
            return;
        }
        self.messages.push(message);
    }

    /// Append several messages in order, applying the merge rule to each.
    pub fn append_messages(&mut self, messages: Vec<Message>) {
        for m in messages {
            self.append_message(m);
        }
    }

    /// Look up a tool by wire name.
    pub fn find_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Whether an assistant message already carries the given tool call id.
    pub fn contains_tool_call(&self, call_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.tool_calls.iter().any(|tc| tc.id == call_id))
    }

    /// The message history as provider-wire JSON.
    pub fn wire_messages(&self) -> serde_json::Value {
        serde_json::to_value(&self.messages).unwrap_or_else(|_| serde_json::json!([]))
    }

    /// The tool set as provider-wire JSON. The `handler` field never
    /// appears on the wire.
    pub fn wire_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                let mut function = serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                });
                if let Some(strict) = t.strict {
                    function["strict"] = serde_json::json!(strict);
                }
                serde_json::json!({ "type": "function", "function": function })
            })
            .collect()
    }
}
