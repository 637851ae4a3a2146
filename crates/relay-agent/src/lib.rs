//! Turn loop for the relay engine.
//!
//! A [`TurnRunner`] admits an execution through a concurrency lane, streams
//! each provider round trip through the [`StreamStateMachine`] and
//! [`ToolCallAssembler`], retries transient failures, accounts token usage,
//! and dispatches tool calls to a [`ToolExecutor`] until the model stops
//! asking for tools.

/// Tool-call argument assembly.
pub mod assembler;
/// Provider backend abstraction.
pub mod backends;
/// Runner configuration.
pub mod config;
/// Tool execution collaborator.
pub mod executor;
/// The turn runner.
pub mod runner;
/// Streaming protocol state machine.
pub mod state_machine;
/// Provider stream events.
pub mod stream;

pub use assembler::ToolCallAssembler;
pub use backends::{ChatRequest, LlmBackend, ScriptedBackend};
pub use config::RunnerConfig;
pub use executor::{FnToolExecutor, ToolExecutor};
pub use runner::{
    ExecuteParams, ExecutionResult, ExecutionStatus, RunEvent, RunListener, TurnRunner,
};
pub use state_machine::{ProtocolEvent, StreamState, StreamStateMachine};
pub use stream::{EventStream, StreamEvent};
