//! Randomized delay spreading, so concurrent callers do not wake in lockstep.

use std::time::Duration;

/// Multiply `delay` by a uniform factor in `[lo, hi)`, saturating.
pub fn scale(delay: Duration, lo: f64, hi: f64) -> Duration {
    let factor = lo + (hi - lo) * fastrand::f64();
    Duration::try_from_secs_f64((delay.as_secs_f64() * factor).max(0.0)).unwrap_or(Duration::MAX)
}

/// Backoff jitter: ×[0.8, 1.2).
pub fn backoff(delay: Duration) -> Duration {
    scale(delay, 0.8, 1.2)
}

/// Rate-limit queue jitter: ×[0.7, 1.3) plus up to 200 ms extra.
pub fn queue_wait(delay: Duration) -> Duration {
    scale(delay, 0.7, 1.3).saturating_add(Duration::from_millis(fastrand::u64(0..200)))
}

/// ±10 % spread, used for the retry predicate deadline.
pub fn spread(delay: Duration) -> Duration {
    scale(delay, 0.9, 1.1)
}
