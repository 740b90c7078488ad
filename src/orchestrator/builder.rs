use super::core::Registry;
use crate::config::RegistryConfig;
use crate::telemetry::MetricsExporter;
use crate::Result;
use std::sync::Arc;

/// Builder for [`Registry`].
///
/// Starts from [`RegistryConfig::default`]; call [`from_env`](Self::from_env)
/// to start from environment overrides instead.
#[derive(Default)]
pub struct RegistryBuilder {
    config: RegistryConfig,
    exporter: Option<Arc<dyn MetricsExporter>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self {
            config: RegistryConfig::from_env(),
            exporter: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n;
        self
    }

    pub fn circuit_capacity(mut self, n: usize) -> Self {
        self.config.circuit_capacity = n;
        self
    }

    pub fn rate_limiter_capacity(mut self, n: usize) -> Self {
        self.config.rate_limiter_capacity = n;
        self
    }

    pub fn metrics_max_keys(mut self, n: usize) -> Self {
        self.config.metrics_max_keys = n;
        self
    }

    pub fn timer_max_samples(mut self, n: usize) -> Self {
        self.config.timer_max_samples = n;
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Validate the configuration and build the registry.
    pub fn build(self) -> Result<Registry> {
        self.config.validate()?;
        let registry = Registry::from_parts(self.config);
        if let Some(exporter) = self.exporter {
            registry.set_exporter(Some(exporter));
        }
        Ok(registry)
    }
}
