use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

/// Outcome of racing a future against a cancellation signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelAware<T> {
    /// The future finished first.
    Value(T),
    /// The signal fired first; the future was dropped.
    Cancelled,
}

/// Runs `fut` until it completes or `token` fires.
///
/// A token that is already cancelled wins without polling `fut`.
pub async fn await_or_cancel<T, F>(token: &CancellationToken, fut: F) -> CancelAware<T>
where
    F: Future<Output = T>,
{
    if token.is_cancelled() {
        return CancelAware::Cancelled;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => CancelAware::Cancelled,
        value = fut => CancelAware::Value(value),
    }
}

/// Sleeps for `duration`, returning [`RelayError::Cancelled`] the instant `token` fires.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> RelayResult<()> {
    match await_or_cancel(token, tokio::time::sleep(duration)).await {
        CancelAware::Value(()) => Ok(()),
        CancelAware::Cancelled => Err(RelayError::Cancelled),
    }
}
