use resilient_run::telemetry::{names, InMemoryExporter, MetricEvent, MetricKey, Metrics};
use resilient_run::{MetricsFormat, Registry, RunOptions};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn flaky_run(registry: &Registry) {
    let _ = registry
        .run(
            |ctx| async move {
                if ctx.attempt() == 1 {
                    anyhow::bail!("cold start");
                }
                Ok(())
            },
            RunOptions::new().retries(2).backoff_fn(|_| 0.0),
        )
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_raw_snapshot_uses_canonical_keys() {
    init_tracing();
    let registry = Registry::new();
    flaky_run(&registry).await;

    let snapshot = registry.metrics_snapshot(MetricsFormat::Raw);
    let raw = snapshot.as_raw().unwrap();
    assert_eq!(raw.counters.get("attempt{attempt:1}"), Some(&1));
    assert_eq!(raw.counters.get("attempt{attempt:2}"), Some(&1));
    assert_eq!(raw.counters.get("failure{aborted:false,attempt:1}"), Some(&1));
    assert_eq!(raw.counters.get("retry{attempt:1}"), Some(&1));
    assert_eq!(raw.timers.get("duration{attempt:2}").map(Vec::len), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_grouped_and_text_snapshots() {
    let registry = Registry::new();
    flaky_run(&registry).await;
    flaky_run(&registry).await;

    let grouped = registry.metrics_snapshot(MetricsFormat::Grouped);
    let grouped = grouped.as_grouped().unwrap();
    let attempts = &grouped.counters[names::ATTEMPT];
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|c| c.value == 2));
    let durations = &grouped.timers[names::DURATION];
    assert_eq!(durations[0].labels.get("attempt").map(String::as_str), Some("2"));
    assert_eq!(durations[0].stats.count, 2);

    let text = registry.metrics_snapshot(MetricsFormat::Text);
    let text = text.as_text().unwrap();
    assert!(text.contains("# TYPE attempt counter"));
    assert!(text.contains("# TYPE duration summary"));
    assert!(text.contains("duration_count{attempt=\"2\"} 2"));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_serializes_to_json() {
    let registry = Registry::new();
    flaky_run(&registry).await;
    let json = serde_json::to_value(registry.metrics_snapshot(MetricsFormat::Raw)).unwrap();
    assert_eq!(json["counters"]["retry{attempt:1}"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_metrics_empties_everything() {
    let registry = Registry::new();
    flaky_run(&registry).await;
    registry.reset_metrics();

    let snapshot = registry.metrics_snapshot(MetricsFormat::Raw);
    let raw = snapshot.as_raw().unwrap();
    assert!(raw.counters.is_empty());
    assert!(raw.timers.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_exporter_sees_every_update() {
    let registry = Registry::new();
    let exporter = Arc::new(InMemoryExporter::new(1_000));
    registry.set_exporter(Some(exporter.clone()));
    flaky_run(&registry).await;

    assert_eq!(exporter.events_named(names::ATTEMPT).len(), 2);
    let timers = exporter.events_named(names::DURATION);
    assert_eq!(timers.len(), 1);
    assert!(matches!(timers[0], MetricEvent::Timer { .. }));

    registry.set_exporter(None);
    exporter.clear();
    flaky_run(&registry).await;
    assert!(exporter.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_broken_exporter_never_affects_run() {
    let registry = Registry::new();
    let failing = |_: &MetricEvent| -> anyhow::Result<()> { anyhow::bail!("sink offline") };
    registry.set_exporter(Some(Arc::new(failing)));

    let value = registry
        .run(|_| async { Ok(7) }, RunOptions::new().timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(value, 7);

    let panicking = |_: &MetricEvent| -> anyhow::Result<()> { panic!("exporter bug") };
    registry.set_exporter(Some(Arc::new(panicking)));
    let value = registry.run(|_| async { Ok(8) }, RunOptions::new()).await.unwrap();
    assert_eq!(value, 8);
    assert_eq!(registry.metrics().counter_total(names::ATTEMPT), 2);
}

#[test]
fn test_percentiles_monotonic() {
    let metrics = Metrics::new(10, 500);
    let key = MetricKey::new("latency").with_label("route", "/search");
    let mut seed = 17u64;
    for _ in 0..500 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        metrics.observe(key.clone(), (seed >> 33) as f64 / 1000.0);
    }

    let stats = metrics.timer_stats(&key).unwrap();
    assert_eq!(stats.count, 500);
    assert!(stats.min <= stats.p50);
    assert!(stats.p50 <= stats.p90);
    assert!(stats.p90 <= stats.p95);
    assert!(stats.p95 <= stats.p99);
    assert!(stats.p99 <= stats.max);
}
