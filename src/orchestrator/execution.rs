//! The attempt loop behind [`Registry::run`].

use super::context::AttemptContext;
use super::core::Registry;
use super::options::RunOptions;
use super::policy::{backoff_delay, evaluate_retry, AttemptOutcome};
use crate::cancel::{CancelReason, CancelToken};
use crate::error::AbortPhase;
use crate::resilience::CircuitBreakerConfig;
use crate::telemetry::{names, MetricKey};
use crate::{Error, ErrorContext, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Runs one attempt raced against its cancellation token and deadline.
///
/// The token is cancelled with a timeout reason when the deadline fires, so
/// callers only need to look at the token to tell an abort from a failure.
async fn execute_attempt<T, F, Fut>(
    task: &F,
    ctx: AttemptContext,
    timeout: Option<Duration>,
) -> anyhow::Result<T>
where
    F: Fn(AttemptContext) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let token = ctx.cancel_token().clone();
    let deadline = async {
        match timeout {
            Some(t) => {
                tokio::time::sleep(t).await;
                token.cancel_with(CancelReason::Timeout(t));
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => Err(anyhow::anyhow!("attempt cancelled")),
        _ = deadline => Err(anyhow::anyhow!("attempt timed out")),
        result = task(ctx) => result,
    }
}

fn reason_of(token: &CancelToken) -> CancelReason {
    token
        .reason()
        .unwrap_or_else(|| CancelReason::Cancelled(String::new()))
}

/// Per-call bookkeeping shared by the loop helpers.
struct RunState<'a> {
    operation_id: &'a str,
    max_attempts: u32,
}

impl RunState<'_> {
    fn context(&self, attempt: u32) -> ErrorContext {
        ErrorContext::new()
            .with_operation_id(self.operation_id)
            .with_attempt(attempt)
            .with_max_attempts(self.max_attempts)
    }

    fn aborted(&self, phase: AbortPhase, token: &CancelToken, attempt: u32) -> Error {
        Error::Aborted {
            phase,
            reason: reason_of(token),
            context: self.context(attempt).with_source("orchestrator"),
        }
    }
}

impl Registry {
    /// Run `task` with retries, timeouts, cancellation, circuit breaking and
    /// rate limiting as configured by `options`.
    ///
    /// `task` is called once per attempt with a fresh [`AttemptContext`];
    /// attempts never overlap. Invalid options fail before any side effect.
    ///
    /// ```rust
    /// use resilient_run::{Registry, RunOptions};
    /// use std::sync::atomic::{AtomicU32, Ordering};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> resilient_run::Result<()> {
    /// let registry = Registry::new();
    /// let calls = AtomicU32::new(0);
    /// let value = registry
    ///     .run(
    ///         |ctx| {
    ///             calls.fetch_add(1, Ordering::SeqCst);
    ///             async move {
    ///                 if ctx.attempt() < 2 {
    ///                     anyhow::bail!("flaky");
    ///                 }
    ///                 Ok(ctx.attempt())
    ///             }
    ///         },
    ///         RunOptions::new().retries(3).backoff_fn(|_| 0.0),
    ///     )
    ///     .await?;
    /// assert_eq!(value, 2);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<T, F, Fut>(&self, task: F, options: RunOptions<T>) -> Result<T>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        options.validate()?;

        let operation_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "run",
            operation_id = %operation_id,
            circuit = ?options.circuit_breaker.as_ref().map(CircuitBreakerConfig::name),
            limiter = ?options.rate_limit.as_ref().map(|rl| rl.name()),
        );
        self.run_inner(task, options, &operation_id)
            .instrument(span)
            .await
    }

    async fn run_inner<T, F, Fut>(
        &self,
        task: F,
        mut options: RunOptions<T>,
        operation_id: &str,
    ) -> Result<T>
    where
        F: Fn(AttemptContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _guard = self.preflight(&options).await?;
        let state = RunState {
            operation_id,
            max_attempts: options.max_attempts(),
        };
        let caller = options.signal.clone().unwrap_or_default();

        let mut attempt = 1;
        loop {
            self.metrics()
                .increment(MetricKey::new(names::ATTEMPT).with_label("attempt", attempt));
            if caller.is_cancelled() {
                return Err(state.aborted(AbortPhase::BeforeStart, &caller, 0));
            }

            let ctx = AttemptContext::new(attempt, caller.child(), options.timeout);
            let started = Instant::now();
            debug!(attempt, max_attempts = state.max_attempts, "starting attempt");
            let result = execute_attempt(&task, ctx.clone(), options.timeout).await;

            match self.classify(result, &ctx, &options, &state).await {
                AttemptOutcome::Success(value) => {
                    self.metrics().observe_since(
                        MetricKey::new(names::DURATION).with_label("attempt", attempt),
                        started,
                    );
                    if let Some(cb) = &options.circuit_breaker {
                        self.circuits().record_success(cb);
                    }
                    debug!(attempt, "attempt succeeded");
                    return Ok(value);
                }
                AttemptOutcome::Retryable(error) => {
                    self.metrics()
                        .increment(MetricKey::new(names::RETRY).with_label("attempt", attempt));
                    let delay = backoff_delay(&options.backoff, attempt, options.max_backoff);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = caller.cancelled() => {
                            return Err(state.aborted(AbortPhase::DuringBackoff, &caller, attempt));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                AttemptOutcome::Terminal(error) => {
                    return self.finish_terminal(error, &mut options, &state, attempt).await;
                }
            }
        }
    }

    async fn classify<T>(
        &self,
        result: anyhow::Result<T>,
        ctx: &AttemptContext,
        options: &RunOptions<T>,
        state: &RunState<'_>,
    ) -> AttemptOutcome<T> {
        let attempt = ctx.attempt();
        let error = match result {
            Ok(value) => return AttemptOutcome::Success(value),
            Err(e) => e,
        };

        let token = ctx.cancel_token();
        let aborted = token.is_cancelled();
        self.metrics().increment(
            MetricKey::new(names::FAILURE)
                .with_label("attempt", attempt)
                .with_label("aborted", aborted),
        );
        if aborted {
            return AttemptOutcome::Terminal(state.aborted(AbortPhase::DuringTask, token, attempt));
        }

        let task_error = |source: anyhow::Error| Error::Task {
            source,
            context: state.context(attempt).with_source("task"),
        };
        if attempt >= state.max_attempts {
            return AttemptOutcome::Terminal(task_error(error));
        }

        let decision = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            d = evaluate_retry(options.retry_if.as_ref(), &error, ctx, options.retry_if_timeout) => Some(d),
        };
        match decision {
            None => AttemptOutcome::Terminal(state.aborted(AbortPhase::DuringTask, token, attempt)),
            Some(Ok(true)) => AttemptOutcome::Retryable(error),
            Some(Ok(false)) => AttemptOutcome::Terminal(task_error(error)),
            Some(Err(failure)) => {
                self.metrics().increment(
                    MetricKey::new(names::RETRY_PREDICATE_FAILED).with_label("reason", failure.as_str()),
                );
                AttemptOutcome::Terminal(task_error(error))
            }
        }
    }

    async fn finish_terminal<T>(
        &self,
        error: Error,
        options: &mut RunOptions<T>,
        state: &RunState<'_>,
        attempt: u32,
    ) -> Result<T> {
        if let Some(cb) = &options.circuit_breaker {
            self.circuits().record_failure(cb);
        }
        self.metrics().increment(
            MetricKey::new(names::TERMINAL_FAILURE).with_label("kind", error.kind().name()),
        );

        let Some(fallback) = options.fallback.take() else {
            warn!(attempt, error = %error, "operation failed");
            return Err(error);
        };

        match fallback.resolve().await {
            Ok(value) => {
                self.metrics().increment(MetricKey::new(names::FALLBACK_USED));
                debug!(attempt, error = %error, "operation failed, fallback used");
                Ok(value)
            }
            Err(fallback_error) => {
                self.metrics().increment(MetricKey::new(names::FALLBACK_FAILED));
                warn!(
                    attempt,
                    error = %error,
                    fallback_error = %fallback_error,
                    "operation and fallback both failed"
                );
                Err(Error::Fallback {
                    original: Box::new(error),
                    fallback: fallback_error,
                    context: state.context(attempt).with_source("fallback"),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter(registry: &Registry, name: &str) -> u64 {
        registry.metrics().counter_total(name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let registry = Registry::new();
        let value = registry
            .run(|_| async { Ok(42) }, RunOptions::new().retries(3))
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(counter(&registry, names::ATTEMPT), 1);
        assert_eq!(counter(&registry, names::RETRY), 0);
        assert_eq!(registry.active_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_exhausts_attempts() {
        let registry = Registry::new();
        let calls = AtomicU32::new(0);
        let err = registry
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(anyhow::anyhow!("down")) }
                },
                RunOptions::new().retries(3),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(counter(&registry, names::RETRY), 3);
        assert_eq!(err.attempt(), Some(4));
        assert!(matches!(err, Error::Task { .. }));
        assert_eq!(registry.active_operations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_retry_is_terminal() {
        let registry = Registry::new();
        let calls = AtomicU32::new(0);
        let err = registry
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(anyhow::anyhow!("fatal: bad input")) }
                },
                RunOptions::new()
                    .retries(5)
                    .retry_if_fn(|e, _| !e.to_string().starts_with("fatal")),
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempt(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_aborts() {
        let registry = Registry::new();
        let err = registry
            .run(
                |_| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                RunOptions::new().retries(2).timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert!(matches!(err.abort_reason(), Some(CancelReason::Timeout(_))));
        assert_eq!(err.attempt(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start() {
        let registry = Registry::new();
        let token = CancelToken::new();
        token.cancel("shutdown");
        let err = registry
            .run(|_| async { Ok(1) }, RunOptions::new().signal(token))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Aborted {
                phase: AbortPhase::BeforeStart,
                ..
            }
        ));
        assert_eq!(err.attempt(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_start_reports_attempt_zero_with_retries() {
        let registry = Registry::new();
        let token = CancelToken::new();
        token.cancel("shutdown");
        let calls = AtomicU32::new(0);
        let err = registry
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }
                },
                RunOptions::new().retries(5).signal(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Aborted {
                phase: AbortPhase::BeforeStart,
                ..
            }
        ));
        assert_eq!(err.attempt(), Some(0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(counter(&registry, names::RETRY), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_exhaustion() {
        let registry = Registry::new();
        let value = registry
            .run(
                |_| async { Err::<&str, _>(anyhow::anyhow!("down")) },
                RunOptions::new().retries(1).fallback_value("X"),
            )
            .await
            .unwrap();
        assert_eq!(value, "X");
        assert_eq!(counter(&registry, names::FALLBACK_USED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_feeds_circuit() {
        let registry = Registry::new();
        let cb = CircuitBreakerConfig::named("svc").with_threshold(2);
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let hits = hits.clone();
            let _ = registry
                .run(
                    move |_| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(anyhow::anyhow!("down")) }
                    },
                    RunOptions::new().circuit_breaker(cb.clone()),
                )
                .await;
        }
        assert_eq!(registry.circuit_status("svc").unwrap().state, CircuitState::Open);

        let err = registry
            .run(
                |_| async { Ok(()) },
                RunOptions::new().circuit_breaker(cb.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
