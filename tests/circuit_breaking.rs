use resilient_run::resilience::{CircuitBreakerConfig, CircuitState, RateLimitConfig};
use resilient_run::telemetry::names;
use resilient_run::{Error, Registry, RegistryConfig, RunOptions};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn payments() -> CircuitBreakerConfig {
    CircuitBreakerConfig::named("payments")
        .with_threshold(3)
        .with_window(Duration::from_secs(10))
        .with_recovery(Duration::from_secs(5))
}

async fn fail_once(registry: &Registry, cfg: &CircuitBreakerConfig) -> Error {
    registry
        .run(
            |_| async { Err::<(), _>(anyhow::anyhow!("502 bad gateway")) },
            RunOptions::new().circuit_breaker(cfg.clone()),
        )
        .await
        .unwrap_err()
}

#[tokio::test(start_paused = true)]
async fn test_opens_after_threshold_and_fails_fast() {
    let registry = Registry::new();
    let cfg = payments();

    for _ in 0..3 {
        assert!(matches!(fail_once(&registry, &cfg).await, Error::Task { .. }));
    }
    let status = registry.circuit_status("payments").unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert_eq!(status.failures, 3);

    let calls = AtomicU32::new(0);
    let err = registry
        .run(
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            RunOptions::new().retries(3).circuit_breaker(cfg.clone()),
        )
        .await
        .unwrap_err();

    match err {
        Error::CircuitOpen { name, retry_after_ms } => {
            assert_eq!(name, "payments");
            assert!(retry_after_ms <= 5_000);
        }
        other => panic!("expected CircuitOpen, got {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(registry.metrics().counter_total(names::ATTEMPT), 3);
    assert_eq!(registry.metrics().counter_total(names::CIRCUIT_OPENED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_does_not_consume_rate_limit_slot() {
    let registry = Registry::new();
    let circuit = CircuitBreakerConfig::named("c").with_threshold(1);
    let limiter = RateLimitConfig::new(5, Duration::from_secs(60)).with_name("r");

    let _ = registry
        .run(
            |_| async { Err::<(), _>(anyhow::anyhow!("refused")) },
            RunOptions::new()
                .circuit_breaker(circuit.clone())
                .rate_limit(limiter.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(registry.circuit_state("c"), CircuitState::Open);
    let before = registry.rate_limit_status("r").unwrap().current_requests;
    assert_eq!(before, 1);

    let err = registry
        .run(
            |_| async { Ok(()) },
            RunOptions::new().circuit_breaker(circuit).rate_limit(limiter),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(registry.rate_limit_status("r").unwrap().current_requests, before);
    assert_eq!(registry.active_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_trial_success_closes() {
    let registry = Registry::new();
    let cfg = payments();
    for _ in 0..3 {
        fail_once(&registry, &cfg).await;
    }

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(registry.circuit_state("payments"), CircuitState::HalfOpen);

    let value = registry
        .run(|_| async { Ok("trial ok") }, RunOptions::new().circuit_breaker(cfg))
        .await
        .unwrap();
    assert_eq!(value, "trial ok");
    assert_eq!(registry.circuit_state("payments"), CircuitState::Closed);
    assert!(registry.circuit_status("payments").is_none());
    assert_eq!(registry.metrics().counter_total(names::CIRCUIT_CLOSED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_trial_failure_reopens() {
    let registry = Registry::new();
    let cfg = payments();
    for _ in 0..3 {
        fail_once(&registry, &cfg).await;
    }

    tokio::time::advance(Duration::from_secs(6)).await;
    fail_once(&registry, &cfg).await;

    let status = registry.circuit_status("payments").unwrap();
    assert_eq!(status.state, CircuitState::Open);
    assert!(matches!(
        fail_once(&registry, &cfg).await,
        Error::CircuitOpen { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_failures_outside_window_do_not_count() {
    let registry = Registry::new();
    let cfg = payments();

    fail_once(&registry, &cfg).await;
    fail_once(&registry, &cfg).await;
    tokio::time::advance(Duration::from_secs(11)).await;
    fail_once(&registry, &cfg).await;

    let status = registry.circuit_status("payments").unwrap();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_is_read_only_and_reset_forgets() {
    let registry = Registry::new();
    let cfg = payments();
    for _ in 0..3 {
        fail_once(&registry, &cfg).await;
    }

    let first = registry.circuit_status("payments").unwrap();
    let second = registry.circuit_status("payments").unwrap();
    assert_eq!(first.state, second.state);
    assert_eq!(first.failures, second.failures);

    assert!(registry.reset_circuit("payments"));
    assert!(registry.circuit_status("payments").is_none());
    assert!(!registry.reset_circuit("payments"));
    assert!(registry.circuit_status("unknown").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_lru_eviction_bounds_circuit_count() {
    let registry = Registry::with_config(RegistryConfig::new().with_circuit_capacity(2)).unwrap();
    for name in ["a", "b", "c"] {
        fail_once(&registry, &CircuitBreakerConfig::named(name)).await;
    }

    assert_eq!(registry.circuits().len(), 2);
    assert!(registry.circuit_status("a").is_none());
    assert!(registry.circuit_status("c").is_some());
    assert_eq!(registry.metrics().counter_total(names::CIRCUIT_EVICTED), 1);
}

#[test]
fn test_config_from_yaml() {
    let cfg: CircuitBreakerConfig = serde_yaml::from_str(
        "name: search\nthreshold: 2\nwindow: 5000\nrecovery: 2000\n",
    )
    .unwrap();
    assert_eq!(cfg.name(), "search");
    assert_eq!(cfg.threshold, 2);
    assert_eq!(cfg.window, Duration::from_secs(5));
    assert!(cfg.validate().is_ok());
}
