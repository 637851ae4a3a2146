use serde::{Deserialize, Serialize};

/// A structured function-invocation request emitted by the model.
///
/// Only fully populated once the stream closes the call; `id` is unique
/// within one round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the provider.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Parsed argument object.
    pub input: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call from its parts.
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The outcome of executing one [`ToolCall`].
///
/// Execution failures are reported with `is_error = true`, never as a Rust error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result answers.
    pub tool_call_id: String,
    /// Output text handed back to the model.
    pub content: String,
    /// Whether execution failed.
    pub is_error: bool,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    /// Creates an error tool result.
    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool metadata passed through to the provider unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name the model calls it by.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters_schema: serde_json::Value,
}
