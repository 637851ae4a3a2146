use futures_util::stream::BoxStream;
use relay_core::{RelayResult, TokenUsage};
use serde::{Deserialize, Serialize};

/// Events delivered by a provider backend for one round trip.
///
/// Consumed strictly in delivery order. Tool-call arguments arrive as JSON
/// text fragments between a start and an end event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of assistant text.
    TextDelta {
        /// The text fragment.
        text: String,
    },

    /// A new tool call has started.
    ToolCallStart {
        /// Provider-assigned call id.
        id: String,
        /// Tool name.
        name: String,
    },

    /// An incremental fragment of tool call arguments (JSON string delta).
    ToolCallDelta {
        /// Call the fragment belongs to.
        id: String,
        /// Raw JSON text fragment.
        arguments_delta: String,
    },

    /// A tool call's arguments are now complete.
    ToolCallEnd {
        /// Call being closed.
        id: String,
    },

    /// Token usage reported by the provider (a delta, not a running total).
    Usage {
        /// Tokens consumed since the previous usage event.
        usage: TokenUsage,
    },

    /// The provider finished the response.
    Done {
        /// Provider stop reason, e.g. `end_turn` or `tool_use`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },
}

/// An ordered, fallible sequence of stream events.
pub type EventStream = BoxStream<'static, RelayResult<StreamEvent>>;
