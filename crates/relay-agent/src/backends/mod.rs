/// Offline backend replaying scripted streams.
pub mod scripted;

use crate::stream::EventStream;
use async_trait::async_trait;
use relay_core::{Message, RelayResult, ToolDescriptor};

pub use scripted::ScriptedBackend;

/// Everything a backend needs to issue one round trip.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    /// Provider-native model id.
    pub model: &'a str,
    /// System prompt, if any.
    pub system_prompt: Option<&'a str>,
    /// Full conversation history, oldest first.
    pub messages: &'a [Message],
    /// Tools the model may call, passed through unchanged.
    pub tools: &'a [ToolDescriptor],
}

/// Trait for LLM provider backends.
///
/// Each provider adapter implements this trait to turn one request into an
/// ordered stream of [`crate::StreamEvent`]s. Transport failures are
/// reported as [`relay_core::RelayError::Provider`] (with status and
/// `Retry-After` when known) or [`relay_core::RelayError::Http`], either
/// from `stream` itself or as an item of the returned stream.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Starts a streaming completion.
    async fn stream(&self, request: ChatRequest<'_>) -> RelayResult<EventStream>;
}
