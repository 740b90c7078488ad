use super::context::AttemptContext;
use super::options::{Backoff, RetryPolicy};
use crate::resilience::jitter;
use crate::Error;
use std::time::Duration;

/// Internal result of one attempt, after classification.
#[derive(Debug)]
pub(crate) enum AttemptOutcome<T> {
    Success(T),
    Retryable(anyhow::Error),
    Terminal(Error),
}

/// Why the retry predicate could not produce an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PredicateFailure {
    Error,
    Timeout,
}

impl PredicateFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredicateFailure::Error => "error",
            PredicateFailure::Timeout => "timeout",
        }
    }
}

/// Evaluates the retry predicate under a jittered deadline.
pub(crate) async fn evaluate_retry(
    policy: &dyn RetryPolicy,
    error: &anyhow::Error,
    ctx: &AttemptContext,
    deadline: Duration,
) -> std::result::Result<bool, PredicateFailure> {
    match tokio::time::timeout(jitter::spread(deadline), policy.should_retry(error, ctx)).await {
        Ok(Ok(retry)) => Ok(retry),
        Ok(Err(e)) => {
            tracing::warn!(attempt = ctx.attempt(), error = %e, "retry predicate failed");
            Err(PredicateFailure::Error)
        }
        Err(_) => {
            tracing::warn!(attempt = ctx.attempt(), "retry predicate timed out");
            Err(PredicateFailure::Timeout)
        }
    }
}

/// Delay to wait after a failed `attempt`, jittered and capped.
pub(crate) fn backoff_delay(backoff: &Backoff, attempt: u32, max_backoff: Duration) -> Duration {
    jitter::backoff(backoff.delay(attempt)).min(max_backoff)
}
