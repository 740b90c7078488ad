//! Resilience primitives shared across `run` invocations.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Named failure-window circuit breakers with LRU eviction |
//! | [`rate_limiter`] | Named sliding-window rate limiters with optional queueing |
//! | [`jitter`] | Randomized delay spreading for backoff and queue waits |
//!
//! ```rust
//! use resilient_run::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitRegistry};
//! use resilient_run::telemetry::Metrics;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics = Arc::new(Metrics::new(100, 100));
//! let circuits = CircuitRegistry::new(16, metrics);
//! let cfg = CircuitBreakerConfig::named("payments")
//!     .with_threshold(3)
//!     .with_recovery(Duration::from_secs(10));
//!
//! // Gate a call, then report its outcome
//! if circuits.check(&cfg).is_ok() {
//!     circuits.record_success(&cfg);
//! }
//! ```

pub mod circuit_breaker;
pub mod jitter;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitRegistry, CircuitState, CircuitStatus};
pub use rate_limiter::{Admission, RateLimitConfig, RateLimitStatus, RateLimiterRegistry};

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
