//! Per-call options for [`Registry::run`](crate::Registry::run).

use super::context::AttemptContext;
use crate::cancel::CancelToken;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub const MAX_RETRIES: u32 = 50;
/// Hard ceiling on attempts per call, whatever `retries` says.
pub const MAX_ATTEMPTS: u32 = MAX_RETRIES + 1;
pub const MAX_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const MAX_BACKOFF: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RETRY_IF_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const MIN_RETRY_IF_TIMEOUT: Duration = Duration::from_millis(100);
pub const MAX_RETRY_IF_TIMEOUT: Duration = Duration::from_millis(30_000);

/// `100ms · 2^(attempt-1)`, saturating.
pub(crate) fn exponential_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor)
}

/// Delay before the next attempt, before jitter and the `max_backoff` cap.
#[derive(Clone)]
pub enum Backoff {
    /// `base · 2^(attempt-1)`, capped at `cap`.
    Exponential { base: Duration, cap: Duration },
    Fixed(Duration),
    /// Caller-supplied curve returning milliseconds for a 1-based attempt.
    ///
    /// Negative results clamp to zero; non-finite results or a panic fall
    /// back to `100ms · 2^(attempt-1)`.
    Custom(Arc<dyn Fn(u32) -> f64 + Send + Sync>),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(5_000),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential { base, cap } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("cap", cap)
                .finish(),
            Backoff::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Backoff {
    pub fn custom(f: impl Fn(u32) -> f64 + Send + Sync + 'static) -> Self {
        Backoff::Custom(Arc::new(f))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Exponential { base, cap } => {
                let ms = exponential_ms(base.as_millis() as u64, attempt);
                Duration::from_millis(ms).min(*cap)
            }
            Backoff::Fixed(d) => *d,
            Backoff::Custom(f) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(attempt))) {
                    Ok(ms) if ms.is_finite() => {
                        let ms = ms.clamp(0.0, MAX_BACKOFF.as_millis() as f64);
                        Duration::from_secs_f64(ms / 1000.0)
                    }
                    _ => Duration::from_millis(exponential_ms(100, attempt)),
                }
            }
        }
    }
}

/// Decides whether a failed attempt should be retried.
///
/// Evaluated under its own deadline; an error or a timeout counts as "do not
/// retry".
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    async fn should_retry(&self, error: &anyhow::Error, ctx: &AttemptContext) -> anyhow::Result<bool>;
}

/// Retry every failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

#[async_trait]
impl RetryPolicy for AlwaysRetry {
    async fn should_retry(&self, _: &anyhow::Error, _: &AttemptContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Synchronous predicate adapter.
pub struct RetryIf<F>(pub F);

#[async_trait]
impl<F> RetryPolicy for RetryIf<F>
where
    F: Fn(&anyhow::Error, &AttemptContext) -> bool + Send + Sync,
{
    async fn should_retry(&self, error: &anyhow::Error, ctx: &AttemptContext) -> anyhow::Result<bool> {
        Ok((self.0)(error, ctx))
    }
}

/// Asynchronous predicate adapter. The returned future must own its data.
pub struct RetryIfAsync<F>(pub F);

#[async_trait]
impl<F, Fut> RetryPolicy for RetryIfAsync<F>
where
    F: Fn(&anyhow::Error, &AttemptContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<bool>> + Send,
{
    async fn should_retry(&self, error: &anyhow::Error, ctx: &AttemptContext) -> anyhow::Result<bool> {
        (self.0)(error, ctx).await
    }
}

/// Last line of defense once retries are exhausted.
pub enum Fallback<T> {
    Value(T),
    Call(Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>),
}

impl<T> Fallback<T> {
    pub fn value(v: T) -> Self {
        Fallback::Value(v)
    }

    pub fn call<F, Fut>(f: F) -> Self
    where
        T: 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Fallback::Call(Box::new(move || f().boxed()))
    }

    pub(crate) async fn resolve(self) -> anyhow::Result<T> {
        match self {
            Fallback::Value(v) => Ok(v),
            Fallback::Call(f) => f().await,
        }
    }
}

impl<T> fmt::Debug for Fallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Value(_) => f.write_str("Fallback::Value(..)"),
            Fallback::Call(_) => f.write_str("Fallback::Call(..)"),
        }
    }
}

/// Options for a single `run` call.
///
/// Setters clamp numeric values into their accepted ranges; nested circuit
/// breaker and rate limit configs are validated when the call starts.
pub struct RunOptions<T> {
    pub(crate) retries: u32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_if: Arc<dyn RetryPolicy>,
    pub(crate) retry_if_timeout: Duration,
    pub(crate) backoff: Backoff,
    pub(crate) max_backoff: Duration,
    pub(crate) signal: Option<CancelToken>,
    pub(crate) fallback: Option<Fallback<T>>,
    pub(crate) circuit_breaker: Option<CircuitBreakerConfig>,
    pub(crate) rate_limit: Option<RateLimitConfig>,
}

impl<T> Default for RunOptions<T> {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: None,
            retry_if: Arc::new(AlwaysRetry),
            retry_if_timeout: DEFAULT_RETRY_IF_TIMEOUT,
            backoff: Backoff::default(),
            max_backoff: DEFAULT_MAX_BACKOFF,
            signal: None,
            fallback: None,
            circuit_breaker: None,
            rate_limit: None,
        }
    }
}

impl<T> fmt::Debug for RunOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("retry_if_timeout", &self.retry_if_timeout)
            .field("backoff", &self.backoff)
            .field("max_backoff", &self.max_backoff)
            .field("signal", &self.signal.is_some())
            .field("fallback", &self.fallback)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

impl<T> RunOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries after the first attempt, clamped to `0..=50`.
    pub fn retries(mut self, n: u32) -> Self {
        self.retries = n.min(MAX_RETRIES);
        self
    }

    /// Per-attempt timeout, clamped to 300 s. Zero disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.min(MAX_TIMEOUT)).filter(|t| !t.is_zero());
        self
    }

    pub fn retry_if(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_if = Arc::new(policy);
        self
    }

    pub fn retry_if_fn<F>(self, f: F) -> Self
    where
        F: Fn(&anyhow::Error, &AttemptContext) -> bool + Send + Sync + 'static,
    {
        self.retry_if(RetryIf(f))
    }

    pub fn retry_if_async<F, Fut>(self, f: F) -> Self
    where
        F: Fn(&anyhow::Error, &AttemptContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.retry_if(RetryIfAsync(f))
    }

    /// Deadline for the retry predicate, clamped to 100 ms ..= 30 s.
    pub fn retry_if_timeout(mut self, timeout: Duration) -> Self {
        self.retry_if_timeout = timeout.clamp(MIN_RETRY_IF_TIMEOUT, MAX_RETRY_IF_TIMEOUT);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff_fn(self, f: impl Fn(u32) -> f64 + Send + Sync + 'static) -> Self {
        self.backoff(Backoff::custom(f))
    }

    /// Upper bound on any single backoff wait, clamped to 60 s.
    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max.min(MAX_BACKOFF);
        self
    }

    pub fn signal(mut self, token: CancelToken) -> Self {
        self.signal = Some(token);
        self
    }

    pub fn fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn fallback_value(self, value: T) -> Self {
        self.fallback(Fallback::Value(value))
    }

    pub fn fallback_fn<F, Fut>(self, f: F) -> Self
    where
        T: 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fallback(Fallback::call(f))
    }

    pub fn circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(cfg);
        self
    }

    pub fn rate_limit(mut self, cfg: RateLimitConfig) -> Self {
        self.rate_limit = Some(cfg);
        self
    }

    /// Attempts this call may make: `retries + 1`, never above 51.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1).min(MAX_ATTEMPTS)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        Ok(())
    }
}
