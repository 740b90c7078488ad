use super::duration_ms;
use crate::telemetry::{names, MetricKey, Metrics};
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_CIRCUIT_NAME: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-call circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Circuit name; `None` uses [`DEFAULT_CIRCUIT_NAME`].
    pub name: Option<String>,
    /// Failures within `window` that open the circuit.
    pub threshold: u32,
    #[serde(with = "duration_ms")]
    pub window: Duration,
    /// How long the circuit stays open before letting a trial call through.
    #[serde(with = "duration_ms")]
    pub recovery: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: None,
            threshold: 5,
            window: Duration::from_millis(60_000),
            recovery: Duration::from_millis(30_000),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::default().with_name(name)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_recovery(mut self, recovery: Duration) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_CIRCUIT_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        let ctx = || ErrorContext::new().with_source("circuit_breaker");
        if self.name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::invalid_argument(
                "circuit_breaker.name must not be empty",
                ctx(),
            ));
        }
        if self.threshold < 1 {
            return Err(Error::invalid_argument(
                "circuit_breaker.threshold must be at least 1",
                ctx().with_details(format!("got {}", self.threshold)),
            ));
        }
        if self.window < Duration::from_millis(1000) {
            return Err(Error::invalid_argument(
                "circuit_breaker.window must be at least 1000 ms",
                ctx().with_details(format!("got {} ms", self.window.as_millis())),
            ));
        }
        if self.recovery < Duration::from_millis(1000) {
            return Err(Error::invalid_argument(
                "circuit_breaker.recovery must be at least 1000 ms",
                ctx().with_details(format!("got {} ms", self.recovery.as_millis())),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the window.
    pub failures: usize,
    #[serde(skip)]
    pub opened_at: Option<Instant>,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug)]
struct Entry {
    failures: VecDeque<Instant>,
    state: CircuitState,
    opened_at: Option<Instant>,
    window: Duration,
    recovery: Duration,
}

impl Entry {
    fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            failures: VecDeque::new(),
            state: CircuitState::Closed,
            opened_at: None,
            window: cfg.window,
            recovery: cfg.recovery,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// State after applying the lazy OPEN → HALF_OPEN transition.
    fn effective_state(&self, now: Instant) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) if now.saturating_duration_since(at) >= self.recovery => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    fn open_remaining(&self, now: Instant) -> Option<Duration> {
        if self.effective_state(now) != CircuitState::Open {
            return None;
        }
        let at = self.opened_at?;
        Some(self.recovery.saturating_sub(now.saturating_duration_since(at)))
    }
}

/// Named failure-window circuit breakers.
///
/// - CLOSED → OPEN when `threshold` failures land inside `window`
/// - OPEN → HALF_OPEN lazily, on the first check after `recovery`
/// - HALF_OPEN → CLOSED on the next success (the entry is dropped)
/// - HALF_OPEN → OPEN when a trial call failure keeps the window at threshold
///
/// Entries are created on first failure and evicted least-recently-used once
/// `capacity` names are tracked. All transitions for a name happen under one
/// lock, so concurrent callers never observe partial updates.
pub struct CircuitRegistry {
    circuits: Mutex<LruCache<String, Entry>>,
    metrics: Arc<Metrics>,
}

impl CircuitRegistry {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            circuits: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counter(&self, name: &'static str, circuit: &str) {
        self.metrics
            .increment(MetricKey::new(name).with_label("circuit", circuit));
    }

    /// Gate a call. Fails with [`Error::CircuitOpen`] while the circuit is open;
    /// otherwise returns the (possibly just half-opened) state.
    pub fn check(&self, cfg: &CircuitBreakerConfig) -> Result<CircuitState> {
        let name = cfg.name();
        let now = Instant::now();
        let mut half_opened = false;
        let outcome = {
            let mut circuits = self.lock();
            let Some(entry) = circuits.get_mut(name) else {
                return Ok(CircuitState::Closed);
            };
            entry.window = cfg.window;
            entry.recovery = cfg.recovery;
            let state = entry.effective_state(now);
            if state == CircuitState::HalfOpen && entry.state == CircuitState::Open {
                entry.state = CircuitState::HalfOpen;
                half_opened = true;
            }
            match entry.open_remaining(now) {
                Some(remaining) => Err(remaining),
                None => Ok(state),
            }
        };

        if half_opened {
            info!(circuit = name, "circuit half-open, allowing trial call");
            self.counter(names::CIRCUIT_HALF_OPEN, name);
        }
        outcome.map_err(|remaining| {
            self.counter(names::CIRCUIT_REJECTED, name);
            Error::CircuitOpen {
                name: name.to_string(),
                retry_after_ms: remaining.as_millis() as u64,
            }
        })
    }

    /// Record a failed call; returns the resulting state.
    pub fn record_failure(&self, cfg: &CircuitBreakerConfig) -> CircuitState {
        let name = cfg.name();
        let now = Instant::now();
        let threshold = cfg.threshold.max(1) as usize;
        let mut evicted = None;
        let (state, opened) = {
            let mut circuits = self.lock();
            if !circuits.contains(name) {
                if let Some((old, _)) = circuits.push(name.to_string(), Entry::new(cfg)) {
                    evicted = Some(old);
                }
            }
            let Some(entry) = circuits.get_mut(name) else {
                return CircuitState::Closed;
            };
            entry.window = cfg.window;
            entry.recovery = cfg.recovery;
            entry.prune(now);
            entry.failures.push_back(now);

            let mut opened = false;
            if entry.failures.len() >= threshold && entry.effective_state(now) != CircuitState::Open {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(now);
                opened = true;
            }
            (entry.effective_state(now), opened)
        };

        if let Some(old) = evicted {
            self.counter(names::CIRCUIT_EVICTED, &old);
        }
        if opened {
            warn!(circuit = name, threshold = cfg.threshold, "circuit opened");
            self.counter(names::CIRCUIT_OPENED, name);
        }
        state
    }

    /// Record a successful call. Closes a half-open circuit.
    pub fn record_success(&self, cfg: &CircuitBreakerConfig) {
        let name = cfg.name();
        let now = Instant::now();
        let closed = {
            let mut circuits = self.lock();
            let half_open = circuits
                .get(name)
                .is_some_and(|e| e.effective_state(now) == CircuitState::HalfOpen);
            if half_open {
                circuits.pop(name);
            }
            half_open
        };
        if closed {
            info!(circuit = name, "circuit closed after successful trial call");
            self.counter(names::CIRCUIT_CLOSED, name);
        }
    }

    /// Read-only status; does not touch recency or stored state.
    pub fn status(&self, name: &str) -> Option<CircuitStatus> {
        let now = Instant::now();
        let circuits = self.lock();
        let entry = circuits.peek(name)?;
        let failures = entry
            .failures
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < entry.window)
            .count();
        Some(CircuitStatus {
            name: name.to_string(),
            state: entry.effective_state(now),
            failures,
            opened_at: entry.opened_at,
            open_remaining_ms: entry.open_remaining(now).map(|d| d.as_millis() as u64),
        })
    }

    /// Current state; unseen and reset circuits are closed.
    pub fn state(&self, name: &str) -> CircuitState {
        self.status(name)
            .map_or(CircuitState::Closed, |status| status.state)
    }

    /// Forget a circuit entirely. Returns whether it existed.
    pub fn reset(&self, name: &str) -> bool {
        self.lock().pop(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (CircuitRegistry, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new(100, 100));
        (CircuitRegistry::new(10, metrics.clone()), metrics)
    }

    fn cfg(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::named("svc")
            .with_threshold(threshold)
            .with_window(Duration::from_secs(10))
            .with_recovery(Duration::from_secs(5))
    }

    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.threshold, 5);
        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.recovery, Duration::from_secs(30));
        assert_eq!(config.name(), DEFAULT_CIRCUIT_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(cfg(0).validate().is_err());
        assert!(cfg(1).with_window(Duration::from_millis(999)).validate().is_err());
        assert!(cfg(1).with_recovery(Duration::from_millis(10)).validate().is_err());
        assert!(CircuitBreakerConfig::named("").validate().is_err());
    }

    #[test]
    fn test_config_deserializes_millis() {
        let c: CircuitBreakerConfig =
            serde_json::from_str(r#"{"name":"db","threshold":2,"window":5000}"#).unwrap();
        assert_eq!(c.name(), "db");
        assert_eq!(c.window, Duration::from_millis(5000));
        assert_eq!(c.recovery, Duration::from_millis(30_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unseen_circuit_is_closed() {
        let (reg, _) = registry();
        assert_eq!(reg.check(&cfg(3)).unwrap(), CircuitState::Closed);
        assert!(reg.status("svc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let (reg, metrics) = registry();
        let c = cfg(3);
        assert_eq!(reg.record_failure(&c), CircuitState::Closed);
        assert_eq!(reg.record_failure(&c), CircuitState::Closed);
        assert!(reg.check(&c).is_ok());
        assert_eq!(reg.record_failure(&c), CircuitState::Open);

        let err = reg.check(&c).unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { retry_after_ms: 5000, .. }));
        assert_eq!(
            metrics.counter(&MetricKey::new(names::CIRCUIT_OPENED).with_label("circuit", "svc")),
            Some(1)
        );
        let status = reg.status("svc").unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_past_threshold_all_counted() {
        let (reg, _) = registry();
        let c = cfg(2);
        for _ in 0..5 {
            reg.record_failure(&c);
        }
        let status = reg.status("svc").unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failures, 5);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.status("svc").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let (reg, _) = registry();
        let c = cfg(2);
        reg.record_failure(&c);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.record_failure(&c), CircuitState::Closed);
        assert_eq!(reg.status("svc").unwrap().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_success_closes() {
        let (reg, _) = registry();
        let c = cfg(1);
        reg.record_failure(&c);
        assert!(reg.check(&c).is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(reg.status("svc").unwrap().state, CircuitState::HalfOpen);
        assert_eq!(reg.check(&c).unwrap(), CircuitState::HalfOpen);

        reg.record_success(&c);
        assert!(reg.status("svc").is_none());
        assert_eq!(reg.check(&c).unwrap(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens() {
        let (reg, _) = registry();
        let c = cfg(2);
        reg.record_failure(&c);
        reg.record_failure(&c);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(reg.check(&c).unwrap(), CircuitState::HalfOpen);
        assert_eq!(reg.record_failure(&c), CircuitState::Open);
        assert!(reg.check(&c).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_keeps_failures() {
        let (reg, _) = registry();
        let c = cfg(3);
        reg.record_failure(&c);
        reg.record_success(&c);
        assert_eq!(reg.status("svc").unwrap().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_read_only() {
        let (reg, _) = registry();
        let c = cfg(1);
        reg.record_failure(&c);
        tokio::time::advance(Duration::from_secs(6)).await;
        let first = reg.status("svc").unwrap();
        let second = reg.status("svc").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_emits_counter() {
        let metrics = Arc::new(Metrics::new(100, 100));
        let reg = CircuitRegistry::new(2, metrics.clone());
        let base = cfg(5);
        reg.record_failure(&base.clone().with_name("a"));
        reg.record_failure(&base.clone().with_name("b"));
        // touch "a"
        reg.check(&base.clone().with_name("a")).unwrap();
        reg.record_failure(&base.clone().with_name("c"));
        assert!(reg.status("a").is_some());
        assert!(reg.status("b").is_none());
        assert_eq!(reg.len(), 2);
        assert_eq!(
            metrics.counter(&MetricKey::new(names::CIRCUIT_EVICTED).with_label("circuit", "b")),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_removes_state() {
        let (reg, _) = registry();
        let c = cfg(1);
        reg.record_failure(&c);
        assert!(reg.reset("svc"));
        assert!(!reg.reset("svc"));
        assert!(reg.check(&c).is_ok());
    }
}
