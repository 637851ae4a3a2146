use crate::model::FallbackAttempt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Top-level error type for the relay turn engine.
///
/// Variants are grouped by failure family: transport errors (retry and
/// fallback candidates), protocol errors (fatal to one round trip), resource
/// errors (lane and breaker admission) and exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A provider rejected or failed a request.
    #[error("Provider error{}: {}", status_suffix(.status), .message)]
    Provider {
        /// HTTP status reported by the provider, when there is one.
        status: Option<u16>,
        /// Provider-supplied error text.
        message: String,
        /// Minimum wait requested by the server (e.g. `Retry-After`).
        retry_after_ms: Option<u64>,
    },

    /// A transport failure without a provider status (connection reset, read error).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The streaming protocol saw an event sequence its transition table forbids.
    #[error("Protocol error: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// The lane's wait queue is already at capacity.
    #[error("Lane '{key}' queue is full ({capacity} waiting)")]
    QueueFull {
        /// Lane key.
        key: String,
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A queued lane waiter gave up before a slot was handed to it.
    #[error("Timed out after {waited_ms}ms waiting for lane '{key}'")]
    LaneTimeout {
        /// Lane key.
        key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Queued waiters were rejected by `clear_waiters` or `dispose`.
    #[error("Lane '{key}' waiters cleared")]
    LaneCleared {
        /// Lane key.
        key: String,
    },

    /// The target's circuit is open; the call was not attempted.
    #[error("Circuit open for '{key}' (retry in {retry_in_ms}ms)")]
    CircuitOpen {
        /// Breaker key.
        key: String,
        /// Time left before a probe is allowed.
        retry_in_ms: u64,
    },

    /// The half-open breaker already has its maximum number of probes in flight.
    #[error("Circuit '{key}' is half-open and its probe limit ({limit}) is reached")]
    ProbeLimit {
        /// Breaker key.
        key: String,
        /// Configured concurrent probe limit.
        limit: u32,
    },

    /// Every fallback candidate failed or was skipped.
    #[error("All fallback candidates failed: {}", summarize_attempts(.attempts))]
    FallbackExhausted {
        /// Full audit trail, in attempt order.
        attempts: Vec<FallbackAttempt>,
    },

    /// The caller's cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// A tool executor failed outside of a per-call result.
    #[error("Tool error: {0}")]
    Tool(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error originating from the turn loop itself.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    /// Builds a provider error from a status code and message.
    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        RelayError::Provider {
            status: Some(status),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Server-requested minimum delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::Provider {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Whether this error is the caller's own cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }

    /// HTTP status carried by a provider error.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Provider { status, .. } => *status,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" {s}")).unwrap_or_default()
}

fn summarize_attempts(attempts: &[FallbackAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .filter(|a| !a.success)
        .map(|a| {
            format!(
                "{}: {}",
                a.model,
                a.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a failed call is worth retrying or failing over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    /// 429 or provider-side throttling.
    RateLimit,
    /// 5xx from the provider.
    ServerError,
    /// The request or stream timed out.
    Timeout,
    /// The model is missing, overloaded or temporarily disabled.
    ModelUnavailable,
    /// The request does not fit the model's context window.
    ContextOverflow,
    /// A transport failure that matched no specific pattern.
    Unknown,
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::ServerError => "server_error",
            FailoverReason::Timeout => "timeout",
            FailoverReason::ModelUnavailable => "model_unavailable",
            FailoverReason::ContextOverflow => "context_overflow",
            FailoverReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display_includes_status() {
        let err = RelayError::provider(429, "slow down");
        assert_eq!(err.to_string(), "Provider error 429: slow down");
        assert_eq!(err.status(), Some(429));

        let bare = RelayError::Provider {
            status: None,
            message: "stream reset".into(),
            retry_after_ms: None,
        };
        assert_eq!(bare.to_string(), "Provider error: stream reset");
    }

    #[test]
    fn retry_after_only_from_provider_errors() {
        let err = RelayError::Provider {
            status: Some(429),
            message: "rate limited".into(),
            retry_after_ms: Some(1500),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(RelayError::Http("reset".into()).retry_after(), None);
    }

    #[test]
    fn exhausted_error_lists_failures() {
        let err = RelayError::FallbackExhausted {
            attempts: vec![
                FallbackAttempt::failed("a/one", "Provider error 429: busy", 3),
                FallbackAttempt::failed("b/two", "Provider error 503: down", 4),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("a/one: Provider error 429: busy"));
        assert!(text.contains("b/two: Provider error 503: down"));
    }

    #[test]
    fn failover_reason_serializes_snake_case() {
        let json = serde_json::to_string(&FailoverReason::ModelUnavailable).unwrap();
        assert_eq!(json, "\"model_unavailable\"");
        assert_eq!(FailoverReason::RateLimit.to_string(), "rate_limit");
    }
}
