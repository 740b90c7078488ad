//! Bounded in-memory counter and timer registries.

use super::exporter::{MetricEvent, MetricsExporter};
use super::snapshot::{
    GroupedMetrics, LabeledCounter, LabeledTimer, MetricsFormat, MetricsSnapshot, RawMetrics,
    TimerStats,
};
use arc_swap::ArcSwapOption;
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::warn;

/// A metric name plus its label set.
///
/// Labels live in a `BTreeMap`, so the canonical form is independent of the
/// order labels were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl MetricKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.labels.insert(key.into(), value.to_string());
        self
    }

    /// `name` or `name{k1:v1,k2:v2}` with keys sorted.
    pub fn canonical(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        format!("{}{{{}}}", self.name, parts.join(","))
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[derive(Debug, Clone)]
struct CounterSeries {
    key: MetricKey,
    value: u64,
}

#[derive(Debug, Clone)]
struct TimerSeries {
    key: MetricKey,
    samples: VecDeque<f64>,
}

struct Inner {
    counters: LruCache<String, CounterSeries>,
    timers: LruCache<String, TimerSeries>,
}

struct ExporterSlot(Arc<dyn MetricsExporter>);

/// Counter and timer registries shared by every component of a registry.
///
/// Both registries hold at most `max_keys` distinct series; the least
/// recently updated series is evicted to make room for a new one. Timer
/// series keep the newest `max_samples` observations.
pub struct Metrics {
    inner: Mutex<Inner>,
    max_samples: usize,
    exporter: ArcSwapOption<ExporterSlot>,
}

impl Metrics {
    pub fn new(max_keys: usize, max_samples: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                counters: LruCache::new(cap),
                timers: LruCache::new(cap),
            }),
            max_samples: max_samples.max(1),
            exporter: ArcSwapOption::empty(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or clear, with `None`) the push hook.
    pub fn set_exporter(&self, exporter: Option<Arc<dyn MetricsExporter>>) {
        self.exporter.store(exporter.map(|e| Arc::new(ExporterSlot(e))));
    }

    pub fn increment(&self, key: MetricKey) {
        self.add(key, 1);
    }

    pub fn add(&self, key: MetricKey, delta: u64) {
        let canonical = key.canonical();
        let total = {
            let mut inner = self.lock();
            match inner.counters.get_mut(&canonical) {
                Some(series) => {
                    series.value = series.value.saturating_add(delta);
                    series.value
                }
                None => {
                    inner.counters.push(
                        canonical,
                        CounterSeries {
                            key: key.clone(),
                            value: delta,
                        },
                    );
                    delta
                }
            }
        };
        self.export(|| MetricEvent::Counter { key, delta, total });
    }

    /// Record one raw observation. Non-finite values are dropped.
    pub fn observe(&self, key: MetricKey, value: f64) {
        if !value.is_finite() {
            return;
        }
        let canonical = key.canonical();
        {
            let mut inner = self.lock();
            match inner.timers.get_mut(&canonical) {
                Some(series) => {
                    series.samples.push_back(value);
                    while series.samples.len() > self.max_samples {
                        series.samples.pop_front();
                    }
                }
                None => {
                    let mut samples = VecDeque::with_capacity(self.max_samples.min(64));
                    samples.push_back(value);
                    inner.timers.push(
                        canonical,
                        TimerSeries {
                            key: key.clone(),
                            samples,
                        },
                    );
                }
            }
        }
        self.export(|| MetricEvent::Timer { key, value });
    }

    /// Record the milliseconds elapsed since `started`.
    pub fn observe_since(&self, key: MetricKey, started: Instant) {
        self.observe(key, started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Current value of a counter, without touching its recency.
    pub fn counter(&self, key: &MetricKey) -> Option<u64> {
        self.lock().counters.peek(&key.canonical()).map(|s| s.value)
    }

    /// Sum of every counter series named `name`, across label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.lock()
            .counters
            .iter()
            .filter(|(_, s)| s.key.name == name)
            .map(|(_, s)| s.value)
            .fold(0u64, |acc, v| acc.saturating_add(v))
    }

    pub fn timer_stats(&self, key: &MetricKey) -> Option<TimerStats> {
        let inner = self.lock();
        let series = inner.timers.peek(&key.canonical())?;
        TimerStats::from_samples(series.samples.iter().copied())
    }

    pub fn snapshot(&self, format: MetricsFormat) -> MetricsSnapshot {
        let (counters, timers) = {
            let inner = self.lock();
            let counters: Vec<CounterSeries> = inner.counters.iter().map(|(_, s)| s.clone()).collect();
            let timers: Vec<TimerSeries> = inner.timers.iter().map(|(_, s)| s.clone()).collect();
            (counters, timers)
        };

        match format {
            MetricsFormat::Raw => MetricsSnapshot::Raw(RawMetrics {
                counters: counters
                    .into_iter()
                    .map(|s| (s.key.canonical(), s.value))
                    .collect(),
                timers: timers
                    .into_iter()
                    .map(|s| (s.key.canonical(), s.samples.into_iter().collect()))
                    .collect(),
            }),
            MetricsFormat::Grouped => MetricsSnapshot::Grouped(group(counters, timers)),
            MetricsFormat::Text => MetricsSnapshot::Text(group(counters, timers).to_text()),
        }
    }

    /// Clear both registries under a single lock.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.counters.clear();
        inner.timers.clear();
    }

    fn export(&self, event: impl FnOnce() -> MetricEvent) {
        let guard = self.exporter.load();
        let Some(slot) = guard.as_ref() else {
            return;
        };
        let event = event();
        match std::panic::catch_unwind(AssertUnwindSafe(|| slot.0.export(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(metric = %event.key(), error = %e, "metrics exporter failed"),
            Err(_) => warn!(metric = %event.key(), "metrics exporter panicked"),
        }
    }
}

fn group(counters: Vec<CounterSeries>, timers: Vec<TimerSeries>) -> GroupedMetrics {
    let mut grouped = GroupedMetrics::default();
    for s in counters {
        grouped
            .counters
            .entry(s.key.name)
            .or_default()
            .push(LabeledCounter {
                labels: s.key.labels,
                value: s.value,
            });
    }
    for s in timers {
        if let Some(stats) = TimerStats::from_samples(s.samples.iter().copied()) {
            grouped
                .timers
                .entry(s.key.name)
                .or_default()
                .push(LabeledTimer {
                    labels: s.key.labels,
                    stats,
                });
        }
    }
    for entries in grouped.counters.values_mut() {
        entries.sort_by(|a, b| a.labels.cmp(&b.labels));
    }
    for entries in grouped.timers.values_mut() {
        entries.sort_by(|a, b| a.labels.cmp(&b.labels));
    }
    grouped
}
