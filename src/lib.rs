//! # resilient-run
//!
//! Resilience orchestration for asynchronous work.
//!
//! ## Overview
//!
//! Wrap any fallible async operation with bounded retries, per-attempt
//! timeouts, cooperative cancellation, a sliding-window rate limiter, a
//! per-name circuit breaker and in-memory metrics, without hand-rolling the
//! retry loop.
//!
//! ## Key Features
//!
//! - **Attempt loop**: [`Registry::run`] retries with jittered, capped backoff
//!   and a time-boxed retry predicate
//! - **Cancellation**: [`CancelToken`] composes caller signals with per-attempt timeouts
//! - **Circuit breaking**: named CLOSED/OPEN/HALF_OPEN circuits via [`resilience`]
//! - **Rate limiting**: named sliding windows, fail-fast or queued
//! - **Metrics**: bounded counters and timers with raw, grouped and text snapshots via [`telemetry`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilient_run::resilience::{CircuitBreakerConfig, RateLimitConfig};
//! use resilient_run::{Registry, RunOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> resilient_run::Result<()> {
//!     let registry = Registry::new();
//!
//!     let body = registry
//!         .run(
//!             |ctx| async move {
//!                 tracing::debug!(attempt = ctx.attempt(), "fetching");
//!                 Ok::<_, anyhow::Error>("payload".to_string())
//!             },
//!             RunOptions::new()
//!                 .retries(3)
//!                 .timeout(Duration::from_secs(2))
//!                 .circuit_breaker(CircuitBreakerConfig::named("upstream"))
//!                 .rate_limit(RateLimitConfig::new(10, Duration::from_secs(1)).with_queue(true))
//!                 .fallback_value("cached".to_string()),
//!         )
//!         .await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | `run`, options, attempt context and the shared registry |
//! | [`resilience`] | Circuit breaker and rate limiter registries |
//! | [`telemetry`] | Counters, timers, snapshots and the push hook |
//! | [`cancel`] | Cancellation tokens and reasons |
//! | [`config`] | Registry sizing and loaders |

pub mod cancel;
pub mod config;
pub mod orchestrator;
pub mod resilience;
pub mod telemetry;

pub use cancel::{CancelReason, CancelToken};
pub use config::RegistryConfig;
pub use orchestrator::{
    AttemptContext, Backoff, Fallback, Registry, RegistryBuilder, RetryPolicy, RunOptions,
};
pub use telemetry::{MetricsFormat, MetricsSnapshot};

use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Arc;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{AbortPhase, Error, ErrorContext, ErrorKind};

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::from_env()));

/// Process-wide registry, sized from `RESILIENT_RUN_*` on first use.
pub fn global() -> Arc<Registry> {
    GLOBAL.clone()
}

/// [`Registry::run`] on the [`global`] registry.
pub async fn run<T, F, Fut>(task: F, options: RunOptions<T>) -> Result<T>
where
    F: Fn(AttemptContext) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let registry = global();
    registry.run(task, options).await
}
