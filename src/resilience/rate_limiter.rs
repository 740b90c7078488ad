use super::duration_ms;
use super::jitter;
use crate::cancel::{CancelReason, CancelToken};
use crate::error::AbortPhase;
use crate::telemetry::{names, MetricKey, Metrics};
use crate::{Error, ErrorContext, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_LIMITER_NAME: &str = "default";

/// Per-call rate limit settings.
///
/// `max_requests` and `window` are fixed when a name is first used; later
/// calls under the same name reuse the original limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Limiter name; `None` uses [`DEFAULT_LIMITER_NAME`].
    pub name: Option<String>,
    pub max_requests: u32,
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    /// Wait for a slot instead of failing immediately.
    pub queue: bool,
    #[serde(rename = "queue_max_wait_ms", with = "duration_ms")]
    pub queue_max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_requests: 10,
            window: Duration::from_secs(1),
            queue: false,
            queue_max_wait: Duration::from_millis(30_000),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_queue_max_wait(mut self, max_wait: Duration) -> Self {
        self.queue_max_wait = max_wait;
        self
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_LIMITER_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        let ctx = || ErrorContext::new().with_source("rate_limit");
        if self.name.as_deref().is_some_and(str::is_empty) {
            return Err(Error::invalid_argument("rate_limit.name must not be empty", ctx()));
        }
        if self.max_requests < 1 {
            return Err(Error::invalid_argument(
                "rate_limit.max_requests must be at least 1",
                ctx().with_details(format!("got {}", self.max_requests)),
            ));
        }
        if self.window < Duration::from_millis(1) {
            return Err(Error::invalid_argument(
                "rate_limit.window_ms must be at least 1",
                ctx().with_details(format!("got {:?}", self.window)),
            ));
        }
        Ok(())
    }
}

/// Outcome of a single check-then-register step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied { retry_after: Duration },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub name: String,
    pub current_requests: usize,
    pub capacity_remaining: usize,
    /// Oldest request still inside the window. Monotonic, so not serialized.
    #[serde(skip)]
    pub oldest_request_timestamp: Option<Instant>,
    /// Serialized form of `oldest_request_timestamp`: its age in ms at the time of the query.
    pub oldest_request_age_ms: Option<u64>,
    pub ms_until_next_slot: u64,
    pub window_ms: u64,
    pub is_at_limit: bool,
}

#[derive(Debug)]
struct Entry {
    timestamps: VecDeque<Instant>,
    max_requests: usize,
    window: Duration,
}

impl Entry {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: Instant) -> impl Iterator<Item = &Instant> {
        let window = self.window;
        self.timestamps
            .iter()
            .filter(move |&&t| now.saturating_duration_since(t) < window)
    }
}

/// Named sliding-window rate limiters.
///
/// Each limiter keeps the timestamps of admitted requests inside its window;
/// a request is admitted while fewer than `max_requests` remain. Limiters are
/// created on first use and evicted least-recently-used beyond `capacity`.
pub struct RateLimiterRegistry {
    limiters: Mutex<LruCache<String, Entry>>,
    metrics: Arc<Metrics>,
}

impl RateLimiterRegistry {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            limiters: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.limiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counter(&self, name: &'static str, limiter: &str) {
        self.metrics
            .increment(MetricKey::new(name).with_label("limiter", limiter));
    }

    /// Atomically check for a free slot and, if there is one, take it.
    pub fn try_acquire(&self, cfg: &RateLimitConfig) -> Admission {
        let name = cfg.name();
        let now = Instant::now();
        let mut evicted = None;
        let admission = {
            let mut limiters = self.lock();
            if !limiters.contains(name) {
                let entry = Entry {
                    timestamps: VecDeque::new(),
                    max_requests: cfg.max_requests.max(1) as usize,
                    window: cfg.window,
                };
                if let Some((old, _)) = limiters.push(name.to_string(), entry) {
                    evicted = Some(old);
                }
            }
            match limiters.get_mut(name) {
                Some(entry) => {
                    entry.prune(now);
                    if entry.timestamps.len() < entry.max_requests {
                        entry.timestamps.push_back(now);
                        Admission::Admitted
                    } else {
                        let retry_after = entry
                            .timestamps
                            .front()
                            .map(|&oldest| (oldest + entry.window).saturating_duration_since(now))
                            .unwrap_or_default();
                        Admission::Denied { retry_after }
                    }
                }
                None => Admission::Admitted,
            }
        };
        if let Some(old) = evicted {
            self.counter(names::RATE_LIMITER_EVICTED, &old);
        }
        admission
    }

    /// Acquire a slot, queueing if the config allows it.
    ///
    /// Queued callers sleep for a jittered estimate of when the oldest request
    /// leaves the window, then re-check; a freed slot is not reserved, so a
    /// concurrent caller may take it first. Total queueing time is bounded by
    /// `queue_max_wait`, and the wait ends early if `cancel` fires.
    pub async fn acquire(&self, cfg: &RateLimitConfig, cancel: Option<&CancelToken>) -> Result<()> {
        let name = cfg.name();
        let started = Instant::now();
        loop {
            let retry_after = match self.try_acquire(cfg) {
                Admission::Admitted => return Ok(()),
                Admission::Denied { retry_after } => retry_after,
            };

            if !cfg.queue {
                self.counter(names::RATE_LIMIT_REJECTED, name);
                return Err(Error::RateLimitExceeded {
                    name: name.to_string(),
                    retry_after_ms: retry_after.as_millis() as u64,
                });
            }

            let wait = jitter::queue_wait(retry_after);
            let budget = cfg.queue_max_wait.saturating_sub(started.elapsed());
            if wait > budget {
                self.counter(names::RATE_LIMIT_QUEUE_TIMEOUT, name);
                return Err(Error::RateLimitQueueTimeout {
                    name: name.to_string(),
                    wait_ms: (started.elapsed() + wait).as_millis() as u64,
                    max_wait_ms: cfg.queue_max_wait.as_millis() as u64,
                });
            }

            self.counter(names::RATE_LIMIT_QUEUED, name);
            debug!(limiter = name, wait_ms = wait.as_millis() as u64, "queued for rate limit slot");
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(Error::Aborted {
                                phase: AbortPhase::WhileQueued,
                                reason: token
                                    .reason()
                                    .unwrap_or_else(|| CancelReason::Cancelled(String::new())),
                                context: ErrorContext::new().with_attempt(0).with_source("rate_limit"),
                            });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Read-only status; does not prune or touch recency.
    pub fn status(&self, name: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let limiters = self.lock();
        let entry = limiters.peek(name)?;
        let current = entry.in_window(now).count();
        let oldest = entry.in_window(now).next().copied();
        let at_limit = current >= entry.max_requests;
        let ms_until_next_slot = match (at_limit, oldest) {
            (true, Some(t)) => (t + entry.window).saturating_duration_since(now).as_millis() as u64,
            _ => 0,
        };
        Some(RateLimitStatus {
            name: name.to_string(),
            current_requests: current,
            capacity_remaining: entry.max_requests.saturating_sub(current),
            oldest_request_timestamp: oldest,
            oldest_request_age_ms: oldest.map(|t| now.saturating_duration_since(t).as_millis() as u64),
            ms_until_next_slot,
            window_ms: entry.window.as_millis() as u64,
            is_at_limit: at_limit,
        })
    }

    /// Clear the request log for a name. Returns whether it existed.
    pub fn reset(&self, name: &str) -> bool {
        match self.lock().peek_mut(name) {
            Some(entry) => {
                entry.timestamps.clear();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
