//! Registry-wide configuration: capacities and the global concurrency ceiling.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_CONCURRENT: usize = 100;
pub const DEFAULT_CIRCUIT_CAPACITY: usize = 1000;
pub const DEFAULT_RATE_LIMITER_CAPACITY: usize = 1000;
pub const DEFAULT_METRICS_MAX_KEYS: usize = 2000;
pub const DEFAULT_TIMER_MAX_SAMPLES: usize = 1000;

/// Sizing knobs for a [`Registry`](crate::Registry).
///
/// Every field bounds memory or concurrency; none may be zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ceiling on concurrently running `run` invocations.
    pub max_concurrent: usize,
    /// Maximum number of named circuits kept before LRU eviction.
    pub circuit_capacity: usize,
    /// Maximum number of named rate limiters kept before LRU eviction.
    pub rate_limiter_capacity: usize,
    /// Maximum distinct series per metrics registry (counters, timers).
    pub metrics_max_keys: usize,
    /// Ring buffer size for each timer series.
    pub timer_max_samples: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            circuit_capacity: DEFAULT_CIRCUIT_CAPACITY,
            rate_limiter_capacity: DEFAULT_RATE_LIMITER_CAPACITY,
            metrics_max_keys: DEFAULT_METRICS_MAX_KEYS,
            timer_max_samples: DEFAULT_TIMER_MAX_SAMPLES,
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<usize>().ok())
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables:
    /// - `RESILIENT_RUN_MAX_CONCURRENT` (default 100)
    /// - `RESILIENT_RUN_CIRCUIT_CAPACITY` (default 1000)
    /// - `RESILIENT_RUN_RATE_LIMITER_CAPACITY` (default 1000)
    /// - `RESILIENT_RUN_METRICS_MAX_KEYS` (default 2000)
    /// - `RESILIENT_RUN_TIMER_MAX_SAMPLES` (default 1000)
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_concurrent: env_usize("RESILIENT_RUN_MAX_CONCURRENT").unwrap_or(d.max_concurrent),
            circuit_capacity: env_usize("RESILIENT_RUN_CIRCUIT_CAPACITY")
                .unwrap_or(d.circuit_capacity),
            rate_limiter_capacity: env_usize("RESILIENT_RUN_RATE_LIMITER_CAPACITY")
                .unwrap_or(d.rate_limiter_capacity),
            metrics_max_keys: env_usize("RESILIENT_RUN_METRICS_MAX_KEYS")
                .unwrap_or(d.metrics_max_keys),
            timer_max_samples: env_usize("RESILIENT_RUN_TIMER_MAX_SAMPLES")
                .unwrap_or(d.timer_max_samples),
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| {
            Error::configuration(
                "failed to parse registry config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("yaml"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| {
            Error::configuration(
                "failed to parse registry config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("json"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_circuit_capacity(mut self, n: usize) -> Self {
        self.circuit_capacity = n;
        self
    }

    pub fn with_rate_limiter_capacity(mut self, n: usize) -> Self {
        self.rate_limiter_capacity = n;
        self
    }

    pub fn with_metrics_max_keys(mut self, n: usize) -> Self {
        self.metrics_max_keys = n;
        self
    }

    pub fn with_timer_max_samples(mut self, n: usize) -> Self {
        self.timer_max_samples = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_concurrent", self.max_concurrent),
            ("circuit_capacity", self.circuit_capacity),
            ("rate_limiter_capacity", self.rate_limiter_capacity),
            ("metrics_max_keys", self.metrics_max_keys),
            ("timer_max_samples", self.timer_max_samples),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(Error::configuration(
                    format!("{} must be at least 1", name),
                    ErrorContext::new()
                        .with_details(format!("{} = 0", name))
                        .with_source("registry_config"),
                ));
            }
        }
        Ok(())
    }
}
