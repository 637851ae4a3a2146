//! Per-target circuit breaker.
//!
//! ```text
//! Closed   → Open:     `failure_threshold` consecutive failures
//! Open     → HalfOpen: `reset_timeout_ms` elapsed since opening
//! HalfOpen → Closed:   a probe succeeds
//! HalfOpen → Open:     a probe fails
//! ```
//!
//! Transitions happen only through failure counting and elapsed time; a
//! caller can force `Closed` with [`CircuitBreaker::reset`] but cannot open a
//! breaker by request.
//!
//! Every admission is stamped with the breaker's epoch, which advances each
//! time the circuit opens or is reset. Outcomes of calls admitted in an older
//! epoch, or of ordinary calls finishing while the circuit is not closed, are
//! dropped: only a probe can close a half-open circuit.

use parking_lot::Mutex;
use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// A limited number of probe calls may pass.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before allowing probes.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Probes allowed in flight while half-open.
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    epoch: u64,
}

impl BreakerInner {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.epoch += 1;
    }
}

/// What [`CircuitBreaker::admit`] granted.
#[derive(Debug, Clone, Copy)]
struct Admission {
    probe: bool,
    epoch: u64,
}

/// Failure-rate gate for one target key (typically a provider).
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Releases a half-open probe slot even if the probe future is dropped.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    held: bool,
}

impl ProbeSlot<'_> {
    fn disarm(&mut self) {
        self.held = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            let mut inner = self.breaker.inner.lock();
            release_probe(&mut inner, self.epoch);
        }
    }
}

/// Gives back a probe slot taken in `epoch`; slots from an older epoch were
/// already discarded.
fn release_probe(inner: &mut BreakerInner, epoch: u64) {
    if inner.epoch == epoch {
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for `key`.
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
                epoch: 0,
            }),
        }
    }

    /// The key this breaker guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Moves `Open` to `HalfOpen` once the reset timeout has elapsed.
    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|t| t.elapsed() >= self.reset_timeout())
            .unwrap_or(true);
        if elapsed {
            inner.state = CircuitState::HalfOpen;
            inner.probes_in_flight = 0;
            info!(key = %self.key, "Circuit half-open, allowing probes");
        }
    }

    /// Current state, accounting for an elapsed reset timeout.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether calls would currently be rejected without a probe.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Admits a call, marking half-open admissions as probes.
    fn admit(&self) -> RelayResult<Admission> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let epoch = inner.epoch;
        match inner.state {
            CircuitState::Closed => Ok(Admission {
                probe: false,
                epoch,
            }),
            CircuitState::Open => {
                let retry_in = inner
                    .opened_at
                    .map(|t| self.reset_timeout().saturating_sub(t.elapsed()))
                    .unwrap_or_default();
                Err(RelayError::CircuitOpen {
                    key: self.key.clone(),
                    retry_in_ms: retry_in.as_millis() as u64,
                })
            }
            CircuitState::HalfOpen => {
                let limit = self.config.half_open_max_probes.max(1);
                if inner.probes_in_flight >= limit {
                    return Err(RelayError::ProbeLimit {
                        key: self.key.clone(),
                        limit,
                    });
                }
                inner.probes_in_flight += 1;
                Ok(Admission { probe: true, epoch })
            }
        }
    }

    /// Whether an outcome of `admission` may still move the breaker.
    fn is_current(inner: &BreakerInner, admission: Admission) -> bool {
        if inner.epoch != admission.epoch {
            return false;
        }
        match inner.state {
            CircuitState::Closed => !admission.probe,
            CircuitState::HalfOpen => admission.probe,
            CircuitState::Open => false,
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.probe {
            release_probe(&mut inner, admission.epoch);
        }
        if !Self::is_current(&inner, admission) {
            debug!(key = %self.key, state = ?inner.state, "Ignoring success from a stale admission");
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            info!(key = %self.key, "Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.probe {
            release_probe(&mut inner, admission.epoch);
        }
        if !Self::is_current(&inner, admission) {
            debug!(key = %self.key, state = ?inner.state, "Ignoring failure from a stale admission");
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.open();
                inner.probes_in_flight = 0;
                warn!(key = %self.key, "Probe failed, circuit re-opened");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.open();
                warn!(
                    key = %self.key,
                    failures = inner.consecutive_failures,
                    reset_timeout_ms = self.config.reset_timeout_ms,
                    "Circuit opened"
                );
            }
            _ => {
                debug!(
                    key = %self.key,
                    failures = inner.consecutive_failures,
                    "Recorded failure"
                );
            }
        }
    }

    /// Runs `f` if the breaker permits it, recording the outcome.
    ///
    /// Fails fast with [`RelayError::CircuitOpen`] or [`RelayError::ProbeLimit`]
    /// without invoking `f`. A [`RelayError::Cancelled`] outcome is not counted.
    pub async fn execute<T, F, Fut>(&self, f: F) -> RelayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let admission = self.admit()?;
        let mut slot = ProbeSlot {
            breaker: self,
            epoch: admission.epoch,
            held: admission.probe,
        };
        let result = f().await;
        slot.disarm();
        match &result {
            Ok(_) => self.record_success(admission),
            Err(e) if e.is_cancelled() => {
                if admission.probe {
                    let mut inner = self.inner.lock();
                    release_probe(&mut inner, admission.epoch);
                }
            }
            Err(_) => self.record_failure(admission),
        }
        result
    }

    /// Forces the breaker closed and zeroes its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        inner.epoch += 1;
    }
}

/// Process-wide breakers keyed by target, created lazily on first use.
///
/// Cloning shares the same breakers, so one registry can be handed to every
/// component that needs it.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers all use `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The breaker for `key`, created if needed.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// State of `key`'s breaker; `Closed` if none exists yet.
    pub fn state(&self, key: &str) -> CircuitState {
        let breaker = self.breakers.lock().get(key).cloned();
        breaker.map_or(CircuitState::Closed, |b| b.state())
    }

    /// Whether `key`'s breaker is currently open.
    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    /// Resets one breaker.
    pub fn reset(&self, key: &str) {
        let breaker = self.breakers.lock().get(key).cloned();
        if let Some(b) = breaker {
            b.reset();
        }
    }

    /// Drops every breaker, returning all keys to a fresh closed state.
    pub fn reset_all(&self) {
        self.breakers.lock().clear();
    }
}
