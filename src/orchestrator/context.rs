use crate::cancel::CancelToken;
use std::time::Duration;

/// What a task sees for one attempt.
///
/// Built fresh for every attempt and never mutated afterwards. The token
/// fires when the caller's signal fires or the attempt timeout elapses.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    attempt: u32,
    cancel: CancelToken,
    timeout: Option<Duration>,
}

impl AttemptContext {
    pub(crate) fn new(attempt: u32, cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            attempt,
            cancel,
            timeout,
        }
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Per-attempt timeout, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
