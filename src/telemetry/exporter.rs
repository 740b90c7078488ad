//! Push hook for relaying metric updates to an external system.

use super::metrics::MetricKey;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// A single metric update, delivered synchronously to the exporter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    Counter {
        key: MetricKey,
        delta: u64,
        /// Counter value after the increment.
        total: u64,
    },
    Timer {
        key: MetricKey,
        value: f64,
    },
}

impl MetricEvent {
    pub fn key(&self) -> &MetricKey {
        match self {
            MetricEvent::Counter { key, .. } | MetricEvent::Timer { key, .. } => key,
        }
    }
}

/// Receives every counter increment and timer observation.
///
/// Called inline on the recording path, outside the registry lock. Errors and
/// panics are logged and dropped; they never reach the operation being run.
pub trait MetricsExporter: Send + Sync {
    fn export(&self, event: &MetricEvent) -> anyhow::Result<()>;
}

impl<F> MetricsExporter for F
where
    F: Fn(&MetricEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn export(&self, event: &MetricEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// In-memory exporter for testing and diagnostics.
pub struct InMemoryExporter {
    events: Arc<RwLock<Vec<MetricEvent>>>,
    max_events: usize,
}

impl InMemoryExporter {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .read()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn events_named(&self, name: &str) -> Vec<MetricEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.key().name == name)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsExporter for InMemoryExporter {
    fn export(&self, event: &MetricEvent) -> anyhow::Result<()> {
        let mut events = self
            .events
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory exporter lock poisoned"))?;
        events.push(event.clone());
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}
