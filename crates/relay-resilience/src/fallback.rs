//! Ordered model fallback.
//!
//! [`FallbackChain::run`] walks a candidate list strictly in order. Each
//! candidate gets `max_retries_per_model + 1` attempts through its
//! provider's circuit breaker; a candidate whose breaker is open is skipped.
//! Only failures whose reason is in `fallback_on` advance the chain; anything
//! else (authorization, malformed requests, unclassifiable errors) is
//! returned at once so a fallback never masks it.

use crate::backoff::BackoffPolicy;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::{DefaultClassifier, FailureClassifier};
use relay_core::{
    sleep_or_cancel, CancellationToken, FailoverReason, FallbackAttempt, ListenerHandle,
    Listeners, ModelResolver, RelayError, RelayResult, ResolvedModel,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fallback tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Retries on one candidate before moving to the next.
    #[serde(default = "default_max_retries_per_model")]
    pub max_retries_per_model: u32,
    /// Delay schedule between retries on the same candidate.
    ///
    /// Only the delay fields are read; `backoff.max_retries` is ignored and
    /// `max_retries_per_model` alone bounds the attempts per candidate.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Failure reasons that justify trying another model.
    #[serde(default = "default_fallback_on")]
    pub fallback_on: Vec<FailoverReason>,
}

fn default_max_retries_per_model() -> u32 {
    1
}

/// Context overflow is excluded: another model does not shrink the request.
fn default_fallback_on() -> Vec<FailoverReason> {
    vec![
        FailoverReason::RateLimit,
        FailoverReason::ServerError,
        FailoverReason::Timeout,
        FailoverReason::ModelUnavailable,
    ]
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries_per_model: default_max_retries_per_model(),
            backoff: BackoffPolicy::default(),
            fallback_on: default_fallback_on(),
        }
    }
}

/// Emitted when the chain gives up on one candidate and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackNotice {
    /// Candidate that was abandoned.
    pub previous_model: String,
    /// Candidate that will be tried next.
    pub next_model: String,
    /// Why the previous candidate was abandoned.
    pub reason: FailoverReason,
}

/// A successful chain run.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<T> {
    /// What the work produced.
    pub value: T,
    /// The candidate that produced it.
    pub model: ResolvedModel,
    /// Every call, retry and skip, in order.
    pub attempts: Vec<FallbackAttempt>,
}

/// Runs work against the first viable model in a candidate list.
pub struct FallbackChain {
    config: FallbackConfig,
    breakers: CircuitBreakerRegistry,
    resolver: Arc<dyn ModelResolver>,
    classifier: Arc<dyn FailureClassifier>,
    listeners: Listeners<FallbackNotice>,
}

impl FallbackChain {
    /// Creates a chain using [`DefaultClassifier`].
    pub fn new(
        config: FallbackConfig,
        breakers: CircuitBreakerRegistry,
        resolver: Arc<dyn ModelResolver>,
    ) -> Self {
        Self {
            config,
            breakers,
            resolver,
            classifier: Arc::new(DefaultClassifier),
            listeners: Listeners::new(),
        }
    }

    /// Replaces the failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// The chain's configuration.
    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// The breaker registry this chain consults.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Registers a listener for fallback notices.
    pub fn on_fallback<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&FallbackNotice) + Send + Sync + 'static,
    {
        self.listeners.register(callback)
    }

    fn advance(
        &self,
        candidates: &[String],
        index: usize,
        previous: &str,
        reason: FailoverReason,
    ) {
        let Some(next) = candidates.get(index + 1) else {
            return;
        };
        info!(from = previous, to = %next, %reason, "Falling back to next model");
        self.listeners.emit(&FallbackNotice {
            previous_model: previous.to_string(),
            next_model: next.clone(),
            reason,
        });
    }

    /// Runs `work` against each candidate in order until one succeeds.
    ///
    /// Cancellation is returned immediately. A failure outside
    /// `fallback_on` is returned immediately. When every candidate is spent
    /// the result is [`RelayError::FallbackExhausted`] carrying all attempts.
    pub async fn run<T, F, Fut>(
        &self,
        candidates: &[String],
        cancel: &CancellationToken,
        mut work: F,
    ) -> RelayResult<FallbackOutcome<T>>
    where
        F: FnMut(ResolvedModel) -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        if candidates.is_empty() {
            return Err(RelayError::Config("no fallback candidates given".into()));
        }

        let max_attempts = self.config.max_retries_per_model.saturating_add(1);
        let mut attempts = Vec::new();

        for (index, reference) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }

            let Some(model) = self.resolver.resolve(reference) else {
                warn!(reference = %reference, "Unresolvable model reference, skipping");
                attempts.push(FallbackAttempt::failed(
                    reference.as_str(),
                    "unresolvable model reference",
                    0,
                ));
                self.advance(candidates, index, reference, FailoverReason::ModelUnavailable);
                continue;
            };
            let name = model.qualified_name();
            let breaker = self.breakers.get(&model.provider);

            if breaker.is_open() {
                info!(model = %name, provider = %model.provider, "Circuit open, skipping candidate");
                attempts.push(FallbackAttempt::failed(
                    name.as_str(),
                    format!("circuit open for provider '{}'", model.provider),
                    0,
                ));
                self.advance(candidates, index, &name, FailoverReason::ModelUnavailable);
                continue;
            }

            let mut last_reason = FailoverReason::Unknown;
            for attempt in 0..max_attempts {
                if cancel.is_cancelled() {
                    return Err(RelayError::Cancelled);
                }

                let started = Instant::now();
                let result = breaker.execute(|| work(model.clone())).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let err = match result {
                    Ok(value) => {
                        attempts.push(FallbackAttempt::succeeded(name.as_str(), duration_ms));
                        debug!(model = %name, attempts = attempts.len(), "Fallback chain succeeded");
                        return Ok(FallbackOutcome {
                            value,
                            model,
                            attempts,
                        });
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => e,
                };
                attempts.push(FallbackAttempt::failed(
                    name.as_str(),
                    err.to_string(),
                    duration_ms,
                ));

                if matches!(
                    err,
                    RelayError::CircuitOpen { .. } | RelayError::ProbeLimit { .. }
                ) {
                    last_reason = FailoverReason::ModelUnavailable;
                    break;
                }

                let reason = match self.classifier.classify(&err) {
                    Some(r) if self.config.fallback_on.contains(&r) => r,
                    other => {
                        warn!(
                            model = %name,
                            reason = ?other,
                            error = %err,
                            "Failure is not fallback-worthy"
                        );
                        return Err(err);
                    }
                };
                last_reason = reason;

                if attempt + 1 < max_attempts {
                    let delay = self.config.backoff.delay_for(attempt, err.retry_after());
                    info!(
                        model = %name,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "Retrying candidate"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
            }

            self.advance(candidates, index, &name, last_reason);
        }

        warn!(candidates = candidates.len(), "All fallback candidates failed");
        Err(RelayError::FallbackExhausted { attempts })
    }
}
