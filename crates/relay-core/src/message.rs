use crate::tool::{ToolCall, ToolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// The model.
    Assistant,
    /// A system-level instruction or prompt.
    System,
    /// Results produced by tool invocations.
    Tool,
}

/// A single entry in a conversation transcript.
///
/// Messages are appended by the turn runner and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool outcomes carried by a tool-role message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// An assistant message that also requests tool invocations.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// A single tool-role message folding the results of one tool batch.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        let mut msg = Self::new(Role::Tool, String::new());
        msg.tool_results = results;
        msg
    }

    /// Whether the model asked for tools in this message.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn test_empty_tool_lists_are_not_serialized() {
        let msg = Message::assistant("done");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_results").is_none());
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["content", "id", "role", "timestamp"]);

        let back: Message = serde_json::from_value(json).unwrap();
        assert!(back.tool_calls.is_empty());
    }

    #[test]
    fn test_tool_results_message() {
        let msg = Message::tool_results(vec![
            ToolResult::success("call_1", "ok"),
            ToolResult::error("call_2", "boom"),
        ]);
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_results.len(), 2);
        assert!(msg.tool_results[1].is_error);
    }

    #[test]
    fn test_assistant_with_tools_round_trips() {
        let call = ToolCall::new("call_1", "read_file", json!({"path": "a.txt"}));
        let msg = Message::assistant_with_tools("reading", vec![call]);
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.tool_calls[0].name, "read_file");
        assert_eq!(back.tool_calls[0].input["path"], "a.txt");
    }
}
