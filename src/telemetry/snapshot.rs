//! Snapshot shapes returned by [`Metrics::snapshot`](super::Metrics::snapshot).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Output shape for a metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsFormat {
    /// Canonical key → counter value / raw timer samples.
    #[default]
    Raw,
    /// Metric name → one entry per label combination, timers summarized.
    Grouped,
    /// Line-oriented exposition text (counters plus timer summaries).
    Text,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricsSnapshot {
    Raw(RawMetrics),
    Grouped(GroupedMetrics),
    Text(String),
}

impl MetricsSnapshot {
    pub fn as_raw(&self) -> Option<&RawMetrics> {
        match self {
            MetricsSnapshot::Raw(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_grouped(&self) -> Option<&GroupedMetrics> {
        match self {
            MetricsSnapshot::Grouped(g) => Some(g),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetricsSnapshot::Text(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawMetrics {
    pub counters: BTreeMap<String, u64>,
    pub timers: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupedMetrics {
    pub counters: BTreeMap<String, Vec<LabeledCounter>>,
    pub timers: BTreeMap<String, Vec<LabeledTimer>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledCounter {
    pub labels: BTreeMap<String, String>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledTimer {
    pub labels: BTreeMap<String, String>,
    pub stats: TimerStats,
}

/// Summary statistics over a timer's retained samples.
///
/// Percentiles use nearest-rank indexing into the sorted samples
/// (`floor(p * count)`, clamped to the last index).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimerStats {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl TimerStats {
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut sorted: Vec<f64> = samples.into_iter().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let pct = |p: f64| {
            let idx = ((p * count as f64).floor() as usize).min(count - 1);
            sorted[idx]
        };
        Some(Self {
            count,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            p50: pct(0.50),
            p90: pct(0.90),
            p95: pct(0.95),
            p99: pct(0.99),
        })
    }
}

fn render_labels(labels: &BTreeMap<String, String>, extra: Option<(&str, &str)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{}=\"{}\"", k, v));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl GroupedMetrics {
    /// Render as exposition text: a `# TYPE` line per metric name followed by
    /// one line per label set; timers emit quantile, `_sum` and `_count` lines.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (name, entries) in &self.counters {
            let _ = writeln!(out, "# TYPE {} counter", name);
            for e in entries {
                let _ = writeln!(out, "{}{} {}", name, render_labels(&e.labels, None), e.value);
            }
        }
        for (name, entries) in &self.timers {
            let _ = writeln!(out, "# TYPE {} summary", name);
            for e in entries {
                let s = &e.stats;
                for (q, v) in [("0.5", s.p50), ("0.9", s.p90), ("0.95", s.p95), ("0.99", s.p99)] {
                    let _ = writeln!(
                        out,
                        "{}{} {}",
                        name,
                        render_labels(&e.labels, Some(("quantile", q))),
                        v
                    );
                }
                let labels = render_labels(&e.labels, None);
                let _ = writeln!(out, "{}_sum{} {}", name, labels, s.sum);
                let _ = writeln!(out, "{}_count{} {}", name, labels, s.count);
            }
        }
        out
    }
}
