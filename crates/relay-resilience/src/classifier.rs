use relay_core::{FailoverReason, RelayError};

/// Maps an error to a retry/fallback reason.
///
/// `None` means "not classifiable": the error is never retried or failed over.
pub trait FailureClassifier: Send + Sync {
    /// Classifies `err`.
    fn classify(&self, err: &RelayError) -> Option<FailoverReason>;
}

impl<F> FailureClassifier for F
where
    F: Fn(&RelayError) -> Option<FailoverReason> + Send + Sync,
{
    fn classify(&self, err: &RelayError) -> Option<FailoverReason> {
        self(err)
    }
}

/// Status-code first, message-pattern second classifier for provider errors.
///
/// Authorization failures, malformed requests, cancellation, protocol,
/// lane, breaker and tool errors are never classified.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

const CONTEXT_PATTERNS: &[&str] = &[
    "context length",
    "context_length",
    "context window",
    "maximum context",
    "too many tokens",
    "prompt is too long",
    "request too large",
];

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "authentication",
    "permission denied",
    "invalid_request",
    "bad request",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate_limit", "too many requests", "quota"];

const UNAVAILABLE_PATTERNS: &[&str] = &[
    "overloaded",
    "model not found",
    "model_not_found",
    "no such model",
    "unavailable",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const SERVER_PATTERNS: &[&str] = &[
    "server error",
    "internal error",
    "bad gateway",
    "connection",
    "reset by peer",
    "broken pipe",
    "eof",
    "network",
    "temporar",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

impl DefaultClassifier {
    fn classify_status(status: u16, lower: &str) -> Option<FailoverReason> {
        match status {
            401 | 403 => None,
            429 => Some(FailoverReason::RateLimit),
            408 | 504 => Some(FailoverReason::Timeout),
            404 | 529 => Some(FailoverReason::ModelUnavailable),
            503 if contains_any(lower, UNAVAILABLE_PATTERNS) => {
                Some(FailoverReason::ModelUnavailable)
            }
            400 | 413 | 422 if contains_any(lower, CONTEXT_PATTERNS) => {
                Some(FailoverReason::ContextOverflow)
            }
            500..=599 => Some(FailoverReason::ServerError),
            _ => None,
        }
    }

    fn classify_message(lower: &str) -> Option<FailoverReason> {
        if contains_any(lower, CONTEXT_PATTERNS) {
            return Some(FailoverReason::ContextOverflow);
        }
        if contains_any(lower, NON_RETRYABLE_PATTERNS) {
            return None;
        }
        if contains_any(lower, RATE_LIMIT_PATTERNS) || lower.contains("429") {
            return Some(FailoverReason::RateLimit);
        }
        if contains_any(lower, UNAVAILABLE_PATTERNS) {
            return Some(FailoverReason::ModelUnavailable);
        }
        if contains_any(lower, TIMEOUT_PATTERNS) {
            return Some(FailoverReason::Timeout);
        }
        if contains_any(lower, SERVER_PATTERNS)
            || ["500", "502", "503"].iter().any(|c| lower.contains(c))
        {
            return Some(FailoverReason::ServerError);
        }
        Some(FailoverReason::Unknown)
    }
}

impl FailureClassifier for DefaultClassifier {
    fn classify(&self, err: &RelayError) -> Option<FailoverReason> {
        match err {
            RelayError::Provider {
                status, message, ..
            } => {
                let lower = message.to_ascii_lowercase();
                match status {
                    Some(code) => Self::classify_status(*code, &lower),
                    None => Self::classify_message(&lower),
                }
            }
            RelayError::Http(message) => Self::classify_message(&message.to_ascii_lowercase()),
            RelayError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => Some(FailoverReason::Timeout),
                _ => Some(FailoverReason::ServerError),
            },
            _ => None,
        }
    }
}
