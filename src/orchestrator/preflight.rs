//! Admission gates run before the first attempt.

use super::core::Registry;
use super::options::RunOptions;
use crate::telemetry::{names, MetricKey};
use crate::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Holds one unit of the concurrency budget; released on drop.
#[must_use]
pub(crate) struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Registry {
    /// Unified preflight for a call:
    /// - concurrency budget
    /// - circuit breaker check (optional)
    /// - rate limit slot (optional, may queue)
    ///
    /// The returned guard must live for the whole call.
    pub(crate) async fn preflight<T>(&self, options: &RunOptions<T>) -> Result<ActiveGuard<'_>> {
        let guard = self.admit()?;
        if let Some(cb) = &options.circuit_breaker {
            self.circuits().check(cb)?;
        }
        if let Some(rl) = &options.rate_limit {
            self.rate_limiters().acquire(rl, options.signal.as_ref()).await?;
        }
        Ok(guard)
    }

    fn admit(&self) -> Result<ActiveGuard<'_>> {
        let limit = self.config().max_concurrent;
        let active = self.active_counter();
        match active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < limit).then_some(n + 1)
        }) {
            Ok(_) => Ok(ActiveGuard { active }),
            Err(current) => {
                self.metrics().increment(MetricKey::new(names::CONCURRENCY_REJECTED));
                tracing::warn!(active = current, limit, "concurrency limit reached");
                Err(Error::ConcurrencyExceeded {
                    active: current,
                    limit,
                })
            }
        }
    }
}
