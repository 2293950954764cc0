//! Process-wide cached snapshot of the last archiver run (spec.md §4.5,
//! §9), consumed by `InMemoryCollector`-style scrape handlers that want to
//! avoid touching disk at all.
//!
//! The original keeps this behind a Python `threading.RLock`; nothing in
//! this crate re-enters the cache lock while already holding it, so a
//! plain [`std::sync::Mutex`] (the primitive `pbs-datastore` reaches for
//! anywhere it needs a short-held, non-reentrant critical section) is
//! sufficient and avoids pulling in a reentrant-lock dependency the rest
//! of the dependency stack doesn't otherwise need.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use pmc_types::Metric;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    metrics: Vec<Metric>,
    last_scrape_time: Option<f64>,
    archive_duration_seconds: f64,
}

/// Holds the last successful archiver result. Begins empty and is never
/// persisted — a process restart starts with no cached snapshot, per
/// spec.md §9.
pub struct MetricsCache {
    inner: Mutex<Snapshot>,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCache {
    pub fn new() -> Self {
        MetricsCache {
            inner: Mutex::new(Snapshot::default()),
        }
    }

    /// Overwrite the cache atomically with a fresh archiver result.
    pub fn store(&self, metrics: Vec<Metric>, archive_duration_seconds: f64) {
        let mut guard = self.inner.lock().expect("metrics cache mutex poisoned");
        guard.metrics = metrics;
        guard.archive_duration_seconds = archive_duration_seconds;
        guard.last_scrape_time = Some(now_unix());
    }

    /// The cached metrics, plus a synthetic `archive_duration_seconds`
    /// gauge sample so scrapes surface the archiver's own health (spec.md
    /// §4.5, "Self-metrics"). Empty if no archive run has completed yet.
    pub fn snapshot(&self) -> Vec<Metric> {
        let guard = self.inner.lock().expect("metrics cache mutex poisoned");
        if guard.last_scrape_time.is_none() {
            return Vec::new();
        }
        let mut metrics = guard.metrics.clone();
        metrics.push(archive_duration_metric(guard.archive_duration_seconds));
        metrics
    }

    /// Seconds since the last successful archive run completed, or `None`
    /// if none has.
    pub fn last_scrape_time(&self) -> Option<f64> {
        self.inner
            .lock()
            .expect("metrics cache mutex poisoned")
            .last_scrape_time
    }
}

fn archive_duration_metric(duration: f64) -> Metric {
    use pmc_types::{MetricType, Sample};
    let mut metric = Metric::new("archive_duration_seconds", MetricType::Gauge);
    metric
        .samples
        .push(Sample::new("archive_duration_seconds", Default::default(), duration));
    metric
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmc_types::MetricType;

    #[test]
    fn starts_empty() {
        let cache = MetricsCache::new();
        assert!(cache.snapshot().is_empty());
        assert!(cache.last_scrape_time().is_none());
    }

    #[test]
    fn store_then_snapshot_includes_self_metric() {
        let cache = MetricsCache::new();
        let metric = Metric::new("c", MetricType::Counter);
        cache.store(vec![metric], 0.01);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|m| m.name == "c"));
        assert!(snapshot
            .iter()
            .any(|m| m.name == "archive_duration_seconds"));
        assert!(cache.last_scrape_time().is_some());
    }
}
