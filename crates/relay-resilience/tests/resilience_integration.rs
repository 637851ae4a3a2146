//! Integration tests for relay-resilience: lanes, breakers, back-off and fallback together.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use rand::Rng;
use relay_core::{CancellationToken, ProviderPrefixResolver, RelayError};
use relay_resilience::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lane_occupancy_stays_within_bounds_for_random_sequences() {
    let limit = 3;
    let lanes = LaneRegistry::new(LaneConfig {
        max_concurrent: limit,
        max_queue: 0,
        wait_timeout_ms: 1_000,
    });
    let mut rng = rand::thread_rng();
    let mut held: Vec<LaneHandle> = Vec::new();

    for _ in 0..500 {
        if rng.gen_bool(0.5) {
            match lanes.acquire("session").await {
                Ok(h) => held.push(h),
                Err(RelayError::QueueFull { .. }) => assert_eq!(held.len(), limit),
                Err(other) => panic!("unexpected error: {other}"),
            }
        } else if !held.is_empty() {
            let idx = rng.gen_range(0..held.len());
            let mut h = held.swap_remove(idx);
            h.release();
            if rng.gen_bool(0.2) {
                h.release();
            }
        }
        let occupancy = lanes.occupancy("session");
        assert!(occupancy <= limit);
        assert_eq!(occupancy, held.len());
    }
}

#[tokio::test]
async fn stale_handles_do_not_disturb_new_generation() {
    let lanes = LaneRegistry::new(LaneConfig {
        max_concurrent: 2,
        ..LaneConfig::default()
    });
    let stale: Vec<LaneHandle> = vec![
        lanes.acquire("k").await.unwrap(),
        lanes.acquire("k").await.unwrap(),
    ];
    lanes.reset_generation();

    let fresh = lanes.acquire("k").await.unwrap();
    assert_eq!(lanes.occupancy("k"), 1);
    drop(stale);
    assert_eq!(lanes.occupancy("k"), 1);
    drop(fresh);
    assert_eq!(lanes.occupancy("k"), 0);
}

#[test]
fn lane_config_from_toml() {
    let config: LaneConfig = toml::from_str("max_concurrent = 4\n").unwrap();
    assert_eq!(config.max_concurrent, 4);
    assert_eq!(config.max_queue, LaneConfig::default().max_queue);
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn breaker_threshold_then_single_probe_then_closed() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 10_000,
        half_open_max_probes: 1,
    });
    let breaker = registry.get("anthropic");

    for _ in 0..3 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(RelayError::provider(500, "boom")) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let err = breaker
        .execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::CircuitOpen { .. }));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::advance(Duration::from_secs(10)).await;
    let probe = breaker.execute(|| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, RelayError>("probe")
    });
    let second = async {
        tokio::task::yield_now().await;
        breaker.execute(|| async { Ok("second") }).await
    };
    let (probe, second) = tokio::join!(probe, second);
    assert_eq!(probe.unwrap(), "probe");
    assert!(matches!(second.unwrap_err(), RelayError::ProbeLimit { .. }));
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

// ---------------------------------------------------------------------------
// Back-off honoring Retry-After
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retry_after_floors_the_backoff_sleep() {
    let policy = BackoffPolicy {
        max_retries: 1,
        backoff_base_ms: 10,
        backoff_max_ms: 10,
        ..BackoffPolicy::default()
    };
    let started = tokio::time::Instant::now();
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let out = retry_with_backoff(
        &policy,
        &CancellationToken::new(),
        |e| DefaultClassifier.classify(e).is_some(),
        move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RelayError::Provider {
                        status: Some(429),
                        message: "slow down".into(),
                        retry_after_ms: Some(2_000),
                    })
                } else {
                    Ok(n)
                }
            }
        },
    )
    .await
    .unwrap();
    assert_eq!(out, 1);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

fn fallback_chain(breakers: CircuitBreakerRegistry) -> FallbackChain {
    FallbackChain::new(
        FallbackConfig {
            max_retries_per_model: 0,
            backoff: BackoffPolicy::immediate(0),
            ..FallbackConfig::default()
        },
        breakers,
        Arc::new(ProviderPrefixResolver::new("anthropic")),
    )
}

#[tokio::test]
async fn fallback_moves_past_rate_limited_model() {
    let chain = fallback_chain(CircuitBreakerRegistry::default());
    let models = vec!["claude-sonnet".to_string(), "openai/gpt-4o".to_string()];
    let outcome = chain
        .run(&models, &CancellationToken::new(), |model| async move {
            match model.provider.as_str() {
                "anthropic" => Err(RelayError::provider(429, "rate_limit_error")),
                _ => Ok(format!("answered by {}", model.model_id)),
            }
        })
        .await
        .unwrap();
    assert_eq!(outcome.value, "answered by gpt-4o");
    assert_eq!(outcome.model.qualified_name(), "openai/gpt-4o");
    assert!(outcome.attempts.iter().filter(|a| !a.success).count() >= 1);
    assert_eq!(outcome.attempts.iter().filter(|a| a.success).count(), 1);
    assert!(outcome.attempts.last().unwrap().success);
}

#[tokio::test]
async fn fallback_does_not_mask_authorization_failures() {
    let chain = fallback_chain(CircuitBreakerRegistry::default());
    let models = vec!["anthropic/claude".to_string(), "openai/gpt-4o".to_string()];
    let tried = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let t = Arc::clone(&tried);
    let err = chain
        .run(&models, &CancellationToken::new(), move |model| {
            t.lock().push(model.provider.clone());
            async { Err::<(), _>(RelayError::provider(403, "forbidden")) }
        })
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(403));
    assert_eq!(*tried.lock(), vec!["anthropic".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_open_the_provider_circuit_for_later_runs() {
    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 2,
        ..CircuitBreakerConfig::default()
    });
    let chain = fallback_chain(breakers.clone());
    let models = vec!["anthropic/claude".to_string(), "openai/gpt-4o".to_string()];

    for _ in 0..2 {
        let outcome = chain
            .run(&models, &CancellationToken::new(), |model| async move {
                if model.provider == "anthropic" {
                    Err(RelayError::provider(500, "internal error"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome.model.provider, "openai");
    }
    assert!(breakers.is_open("anthropic"));

    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let outcome = chain
        .run(&models, &CancellationToken::new(), move |model| {
            c.fetch_add(1, Ordering::SeqCst);
            async move { Ok(model.provider) }
        })
        .await
        .unwrap();
    assert_eq!(outcome.value, "openai");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
