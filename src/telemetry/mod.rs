//! In-memory observability: counters, timers and an optional push hook.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Metrics`] | Bounded counter/timer registries keyed by name + labels |
//! | [`MetricKey`] | Metric name plus a sorted label set |
//! | [`MetricsSnapshot`] | Raw, grouped or text view of the registries |
//! | [`MetricsExporter`] | Synchronous push hook for external relays |
//! | [`InMemoryExporter`] | Recording exporter for tests |

pub mod exporter;
pub mod metrics;
pub mod snapshot;

pub use exporter::{InMemoryExporter, MetricEvent, MetricsExporter};
pub use metrics::{MetricKey, Metrics};
pub use snapshot::{
    GroupedMetrics, LabeledCounter, LabeledTimer, MetricsFormat, MetricsSnapshot, RawMetrics,
    TimerStats,
};

/// Metric names emitted by the orchestrator and the registries.
pub mod names {
    /// Counter, labeled `attempt`.
    pub const ATTEMPT: &str = "attempt";
    /// Counter, labeled `attempt` and `aborted`.
    pub const FAILURE: &str = "failure";
    /// Counter, labeled `attempt`.
    pub const RETRY: &str = "retry";
    /// Timer (ms) of successful attempts, labeled `attempt`.
    pub const DURATION: &str = "duration";
    /// Counter, labeled `kind`.
    pub const TERMINAL_FAILURE: &str = "terminal_failure";
    pub const RETRY_PREDICATE_FAILED: &str = "retry_predicate_failed";
    pub const FALLBACK_USED: &str = "fallback_used";
    pub const FALLBACK_FAILED: &str = "fallback_failed";
    pub const CONCURRENCY_REJECTED: &str = "concurrency_rejected";

    pub const CIRCUIT_OPENED: &str = "circuit_opened";
    pub const CIRCUIT_HALF_OPEN: &str = "circuit_half_open";
    pub const CIRCUIT_CLOSED: &str = "circuit_closed";
    pub const CIRCUIT_REJECTED: &str = "circuit_rejected";
    pub const CIRCUIT_EVICTED: &str = "circuit_evicted";

    pub const RATE_LIMIT_REJECTED: &str = "rate_limit_rejected";
    pub const RATE_LIMIT_QUEUED: &str = "rate_limit_queued";
    pub const RATE_LIMIT_QUEUE_TIMEOUT: &str = "rate_limit_queue_timeout";
    pub const RATE_LIMITER_EVICTED: &str = "rate_limiter_evicted";
}
