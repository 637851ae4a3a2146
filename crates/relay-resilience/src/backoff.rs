use rand::Rng;
use relay_core::{sleep_or_cancel, CancellationToken, RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Exponential back-off schedule with an attempt budget.
///
/// Delays grow from `backoff_base_ms` by `factor`, are capped at
/// `backoff_max_ms`, optionally jittered by `±jitter` (a fraction of the
/// delay), and floored by any server-supplied minimum such as `Retry-After`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on any computed delay, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub backoff_max_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Jitter as a fraction of the delay (0 disables it).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_factor() -> f64 {
    2.0
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_base_ms(),
            backoff_max_ms: default_max_ms(),
            factor: default_factor(),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// A policy with no delay between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Total attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry_index` (0 = first retry), before jitter.
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let exp = factor.powi(retry_index.min(63) as i32);
        let raw = (self.backoff_base_ms as f64 * exp).min(self.backoff_max_ms as f64);
        Duration::from_millis(raw.max(0.0) as u64)
    }

    /// Delay before retry `retry_index`, jittered and floored by `server_min`.
    pub fn delay_for(&self, retry_index: u32, server_min: Option<Duration>) -> Duration {
        let mut delay = self.base_delay(retry_index);
        if self.jitter > 0.0 && !delay.is_zero() {
            let spread = self.jitter.min(1.0);
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            let jittered = delay.as_millis() as f64 * (1.0 + offset);
            let capped = jittered.clamp(0.0, self.backoff_max_ms as f64);
            delay = Duration::from_millis(capped as u64);
        }
        match server_min {
            Some(min) if min > delay => min,
            _ => delay,
        }
    }
}

/// Runs `op` until it succeeds, the budget runs out, or `should_retry` says stop.
///
/// `op` receives the 1-based attempt number. A token cancelled before an
/// attempt returns [`RelayError::Cancelled`] without consuming the attempt,
/// and cancelling during a back-off sleep wakes it immediately. When the
/// budget is exhausted the last error is returned unchanged.
pub async fn retry_with_backoff<T, Op, Fut, P>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut should_retry: P,
    mut op: Op,
) -> RelayResult<T>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = RelayResult<T>>,
    P: FnMut(&RelayError) -> bool,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if err.is_cancelled() || attempt >= max_attempts || !should_retry(&err) {
            return Err(err);
        }

        let delay = policy.delay_for(attempt - 1, err.retry_after());
        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable error, backing off"
        );
        sleep_or_cancel(delay, cancel).await?;
    }
}
