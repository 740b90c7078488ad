use super::builder::RegistryBuilder;
use crate::config::RegistryConfig;
use crate::resilience::{
    CircuitRegistry, CircuitState, CircuitStatus, RateLimitStatus, RateLimiterRegistry,
};
use crate::telemetry::{Metrics, MetricsExporter, MetricsFormat, MetricsSnapshot};
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared state behind every `run` call: named circuits, named rate limiters,
/// metrics and the in-flight counter.
///
/// Construct one per process (or per test) and share it by reference or `Arc`.
pub struct Registry {
    config: RegistryConfig,
    metrics: Arc<Metrics>,
    circuits: CircuitRegistry,
    limiters: RateLimiterRegistry,
    active: AtomicUsize,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("circuits", &self.circuits.len())
            .field("rate_limiters", &self.limiters.len())
            .field("active", &self.active_operations())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::from_parts(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    /// Registry sized from `RESILIENT_RUN_*` variables; falls back to defaults
    /// when the environment describes an invalid configuration.
    pub fn from_env() -> Self {
        let config = RegistryConfig::from_env();
        match config.validate() {
            Ok(()) => Self::from_parts(config),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid registry environment configuration");
                Self::new()
            }
        }
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub(crate) fn from_parts(config: RegistryConfig) -> Self {
        let metrics = Arc::new(Metrics::new(config.metrics_max_keys, config.timer_max_samples));
        Self {
            circuits: CircuitRegistry::new(config.circuit_capacity, metrics.clone()),
            limiters: RateLimiterRegistry::new(config.rate_limiter_capacity, metrics.clone()),
            metrics,
            config,
            active: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.limiters
    }

    pub(crate) fn active_counter(&self) -> &AtomicUsize {
        &self.active
    }

    pub fn circuit_status(&self, name: &str) -> Option<CircuitStatus> {
        self.circuits.status(name)
    }

    /// Like [`circuit_status`](Self::circuit_status) but reports closed for
    /// circuits with no stored state.
    pub fn circuit_state(&self, name: &str) -> CircuitState {
        self.circuits.state(name)
    }

    /// Forget a circuit entirely. Returns whether it existed.
    pub fn reset_circuit(&self, name: &str) -> bool {
        self.circuits.reset(name)
    }

    pub fn rate_limit_status(&self, name: &str) -> Option<RateLimitStatus> {
        self.limiters.status(name)
    }

    /// Clear a limiter's request log. Returns whether it existed.
    pub fn reset_rate_limit(&self, name: &str) -> bool {
        self.limiters.reset(name)
    }

    pub fn metrics_snapshot(&self, format: MetricsFormat) -> MetricsSnapshot {
        self.metrics.snapshot(format)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Number of `run` calls currently holding a concurrency slot.
    pub fn active_operations(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Install (or remove, with `None`) the metrics push hook.
    pub fn set_exporter(&self, exporter: Option<Arc<dyn MetricsExporter>>) {
        self.metrics.set_exporter(exporter);
    }
}
