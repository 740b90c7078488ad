use crate::cancel::CancelReason;
use std::fmt;
use thiserror::Error;

/// Structured error context attached to errors raised while running an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Identifier of the `run` invocation that produced the error.
    pub operation_id: Option<String>,
    /// 1-based attempt number the error belongs to (0 when no attempt ran).
    pub attempt: Option<u32>,
    /// Number of attempts the operation was allowed.
    pub max_attempts: Option<u32>,
    /// Additional context about the error (e.g. offending field, expected range)
    pub details: Option<String>,
    /// Component that raised the error (e.g. "options", "circuit_breaker")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Where a cancellation interrupted an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortPhase {
    BeforeStart,
    DuringTask,
    DuringBackoff,
    WhileQueued,
}

impl fmt::Display for AbortPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortPhase::BeforeStart => "before start",
            AbortPhase::DuringTask => "during task",
            AbortPhase::DuringBackoff => "during backoff",
            AbortPhase::WhileQueued => "while queued for a rate limit slot",
        };
        f.write_str(s)
    }
}

/// Unified error type for orchestrated operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {message}{}", format_context(.context))]
    InvalidArgument {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Concurrency limit reached: {active} operations in flight (limit {limit})")]
    ConcurrencyExceeded { active: usize, limit: usize },

    #[error("Circuit breaker '{name}' is open (retry in {retry_after_ms} ms)")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    #[error("Rate limit exceeded for '{name}' (next slot in {retry_after_ms} ms)")]
    RateLimitExceeded { name: String, retry_after_ms: u64 },

    #[error("Rate limit queue for '{name}' would wait {wait_ms} ms, over the {max_wait_ms} ms maximum")]
    RateLimitQueueTimeout {
        name: String,
        wait_ms: u64,
        max_wait_ms: u64,
    },

    #[error("Operation aborted {phase}: {reason}{}", format_context(.context))]
    Aborted {
        phase: AbortPhase,
        reason: CancelReason,
        context: ErrorContext,
    },

    #[error("Task failed: {source}{}", format_context(.context))]
    Task {
        #[source]
        source: anyhow::Error,
        context: ErrorContext,
    },

    #[error("Fallback failed: {fallback} (original error: {original}){}", format_context(.context))]
    Fallback {
        original: Box<Error>,
        fallback: anyhow::Error,
        context: ErrorContext,
    },
}

/// Fieldless classification of [`Error`], stable enough for metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Configuration,
    ConcurrencyExceeded,
    CircuitOpen,
    RateLimitExceeded,
    RateLimitQueueTimeout,
    Aborted,
    Task,
    Fallback,
}

impl ErrorKind {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::Configuration => "configuration",
            Self::ConcurrencyExceeded => "concurrency_exceeded",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::RateLimitQueueTimeout => "rate_limit_queue_timeout",
            Self::Aborted => "aborted",
            Self::Task => "task_failure",
            Self::Fallback => "fallback_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(attempt) = ctx.attempt {
        match ctx.max_attempts {
            Some(max) => parts.push(format!("attempt: {}/{}", attempt, max)),
            None => parts.push(format!("attempt: {}", attempt)),
        }
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref id) = ctx.operation_id {
        parts.push(format!("operation: {}", id));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new invalid-argument error with structured context
    pub fn invalid_argument(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::InvalidArgument {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::ConcurrencyExceeded { .. } => ErrorKind::ConcurrencyExceeded,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Error::RateLimitQueueTimeout { .. } => ErrorKind::RateLimitQueueTimeout,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::Task { .. } => ErrorKind::Task,
            Error::Fallback { .. } => ErrorKind::Fallback,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::InvalidArgument { context, .. }
            | Error::Configuration { context, .. }
            | Error::Aborted { context, .. }
            | Error::Task { context, .. }
            | Error::Fallback { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Attempt number recorded on the error, if it came out of the attempt loop.
    pub fn attempt(&self) -> Option<u32> {
        self.context().and_then(|c| c.attempt)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted { .. })
    }

    /// The cancellation reason for aborted operations.
    pub fn abort_reason(&self) -> Option<&CancelReason> {
        match self {
            Error::Aborted { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// For fallback failures, the terminal error that triggered the fallback.
    pub fn original(&self) -> Option<&Error> {
        match self {
            Error::Fallback { original, .. } => Some(original),
            _ => None,
        }
    }

    /// For fallback failures, the error raised by the fallback itself.
    pub fn fallback_error(&self) -> Option<&anyhow::Error> {
        match self {
            Error::Fallback { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}
