//! Cooperative cancellation for orchestrated operations.
//!
//! A [`CancelToken`] fires at most once and remembers why. Tokens compose:
//! [`CancelToken::child`] derives a token that fires when either the parent
//! or the child itself is cancelled, and the first trigger's reason wins.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a token was triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled by the caller, with a free-form reason.
    Cancelled(String),
    /// The per-attempt deadline elapsed.
    Timeout(Duration),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled(msg) if msg.is_empty() => f.write_str("cancelled"),
            CancelReason::Cancelled(msg) => write!(f, "cancelled: {}", msg),
            CancelReason::Timeout(d) => write!(f, "attempt timed out after {} ms", d.as_millis()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Box<CancelToken>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Derive a token that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Trigger the token. Later calls keep the first reason.
    pub fn cancel_with(&self, reason: CancelReason) {
        let parent_fired = self.parent.as_ref().is_some_and(|p| p.is_cancelled());
        if !parent_fired {
            let _ = self.reason.set(reason);
        }
        self.inner.cancel();
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel_with(CancelReason::Cancelled(reason.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(r) = self.reason.get() {
            return Some(r.clone());
        }
        match &self.parent {
            Some(p) => p.reason(),
            None if self.is_cancelled() => Some(CancelReason::Cancelled(String::new())),
            None => None,
        }
    }

    /// Resolves once the token (or any ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
