//! Message and tool-invocation domain types.
//!
//! These are the value objects that flow through the engine:
//! caller supplies messages → provider replies → extractor yields invocations
//! → tool results are appended as correlated `tool` messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// A structured request to run a named tool with specific arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Correlates the invocation with its tool-result message.
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Key-value arguments
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl ToolInvocation {
    /// Create an invocation with a freshly generated id.
    pub fn new(
        name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.into(),
            arguments,
        }
    }

    /// Render as `name(a=1, b=2)` for logs and transcripts.
    pub fn signature(&self) -> String {
        let args = self
            .arguments
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({args})", self.name)
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content. `None` only on an assistant message whose
    /// tool calls are awaiting results.
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls requested by the assistant, in issue order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,

    /// If this is a tool result, which invocation it answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// For tool results, the originating tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (provider info, error flags, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message carrying tool calls.
    ///
    /// Empty content is stored as `None`.
    pub fn assistant_with_calls(content: Option<String>, calls: Vec<ToolInvocation>) -> Self {
        let content = content.filter(|c| !c.trim().is_empty());
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    /// Create a tool result message correlated to `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, Some(content.into()));
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(tool_name.into());
        msg
    }

    /// Create an error-bearing tool result. The model sees the error text
    /// on its next turn; `metadata.is_error` marks it for callers.
    pub fn tool_error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        let mut msg = Self::tool_result(tool_call_id, tool_name, format!("Error: {error}"));
        msg.metadata
            .insert("is_error".into(), serde_json::Value::Bool(true));
        msg
    }

    /// Content as a string slice, empty when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Whether this is an assistant message requesting tools.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    /// Whether this tool result carries an error.
    pub fn is_error(&self) -> bool {
        self.metadata
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Rough token estimate (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| c.name.len() + serde_json::Value::Object(c.arguments.clone()).to_string().len())
            .sum();
        (self.text().len() + calls) / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn assistant_with_calls_drops_blank_content() {
        let call = ToolInvocation::new("add", serde_json::Map::new());
        let msg = Message::assistant_with_calls(Some("   ".into()), vec![call]);
        assert!(msg.content.is_none());
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn tool_result_links_to_call() {
        let msg = Message::tool_result("call_1", "multiply", "120");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("multiply"));
        assert!(!msg.is_error());
    }

    #[test]
    fn tool_error_is_flagged() {
        let msg = Message::tool_error("call_2", "divide", "division by zero");
        assert!(msg.is_error());
        assert_eq!(msg.text(), "Error: division by zero");
    }

    #[test]
    fn message_serialization_roundtrip() {
        let mut args = serde_json::Map::new();
        args.insert("a".into(), serde_json::json!(15));
        let msg = Message::assistant_with_calls(None, vec![ToolInvocation::new("multiply", args)]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(back.content.is_none());
        assert_eq!(back.tool_calls[0].name, "multiply");
        assert_eq!(back.tool_calls[0].arguments["a"], 15);
    }

    #[test]
    fn invocation_signature() {
        let mut args = serde_json::Map::new();
        args.insert("a".into(), serde_json::json!(15));
        args.insert("b".into(), serde_json::json!(8));
        let call = ToolInvocation::new("multiply", args);
        assert_eq!(call.signature(), "multiply(a=15, b=8)");
        assert!(call.id.starts_with("call_"));
    }
}
