use async_trait::async_trait;
use futures_util::future::join_all;
use relay_core::{CancellationToken, ToolCall, ToolResult};

/// Runs the tool calls a model requests.
///
/// Failures must come back as `is_error` results, never as Rust errors, so
/// the model can see and react to them.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Executes one call.
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult;

    /// Executes a batch concurrently, one result per call in call order.
    async fn execute_batch(&self, calls: &[ToolCall], cancel: &CancellationToken) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.execute(call, cancel))).await
    }
}

/// Adapts an async closure into a [`ToolExecutor`].
pub struct FnToolExecutor<F> {
    f: F,
}

impl<F> FnToolExecutor<F> {
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ToolExecutor for FnToolExecutor<F>
where
    F: Fn(ToolCall, CancellationToken) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ToolResult> + Send,
{
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        (self.f)(call.clone(), cancel.clone()).await
    }
}
