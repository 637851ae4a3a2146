//! Core types and error definitions for the relay turn engine.
//!
//! This crate provides the foundational types shared across all relay crates:
//! error handling, transcript messages, tool call abstractions, token usage
//! accounting, model resolution, cancellation and listener plumbing.
//!
//! # Main types
//!
//! - [`RelayError`] — Unified error enum for every subsystem.
//! - [`RelayResult`] — Convenience alias for `Result<T, RelayError>`.
//! - [`Message`] / [`Role`] — Transcript entries.
//! - [`ToolCall`] / [`ToolResult`] — Tool invocation request and outcome.
//! - [`TokenCounter`] — Per-execution usage accounting with threshold warnings.
//! - [`ResolvedModel`] / [`ModelResolver`] — Provider-qualified model selection.
//! - [`Listeners`] — Callback registry with an unregister capability.

/// Cancellation signal and cancel-aware awaiting.
pub mod cancel;
/// Error types and failure reasons.
pub mod error;
/// Listener registries.
pub mod listener;
/// `tracing` subscriber setup.
pub mod logging;
/// Transcript messages.
pub mod message;
/// Model references and the fallback audit record.
pub mod model;
/// Tool call types.
pub mod tool;
/// Token usage accounting.
pub mod usage;

pub use cancel::{await_or_cancel, sleep_or_cancel, CancelAware, CancellationToken};
pub use error::{FailoverReason, RelayError, RelayResult};
pub use listener::{call_guarded, Callback, ListenerHandle, Listeners};
pub use message::{Message, Role};
pub use model::{FallbackAttempt, ModelResolver, ProviderPrefixResolver, ResolvedModel};
pub use tool::{ToolCall, ToolDescriptor, ToolResult};
pub use usage::{ThresholdWarning, TokenCounter, TokenUsage, DEFAULT_USAGE_THRESHOLDS};
