//! Resilience primitives for the relay turn engine.
//!
//! # Main types
//!
//! - [`BackoffPolicy`] / [`retry_with_backoff`] — Exponential back-off driver.
//! - [`FailureClassifier`] / [`DefaultClassifier`] — Error → failover reason.
//! - [`CircuitBreaker`] / [`CircuitBreakerRegistry`] — Per-provider failure gate.
//! - [`LaneRegistry`] / [`LaneHandle`] — Per-key admission with FIFO hand-off.
//! - [`FallbackChain`] — Ordered model fallback with an audit trail.

/// Exponential back-off and the retry driver.
pub mod backoff;
/// Circuit breakers and their registry.
pub mod circuit_breaker;
/// Failure classification.
pub mod classifier;
/// Ordered model fallback.
pub mod fallback;
/// Concurrency lanes.
pub mod lane;

pub use backoff::{retry_with_backoff, BackoffPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use classifier::{DefaultClassifier, FailureClassifier};
pub use fallback::{FallbackChain, FallbackConfig, FallbackNotice, FallbackOutcome};
pub use lane::{LaneConfig, LaneHandle, LaneRegistry};
