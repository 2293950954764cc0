//! Folds a set of [`MmapStore`] files into Prometheus-shaped [`Metric`]s.
//!
//! Grounded in `examples/original_source/prometheus_client/multiprocess.py`'s
//! `MultiProcessCollector.merge()`, transliterated from Python's duck-typed
//! `Counter`/`Gauge`/`Histogram` branching into matches on
//! [`MetricType`]/[`GaugeMode`]. The two-pass shape — collect raw samples,
//! then a post-pass that folds them per metric-type aggregation rule —
//! mirrors the original directly; only the per-group accumulator types
//! differ (`HashMap` keyed on `(sample_name, labels)` rather than a Python
//! `collections.defaultdict`).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use pmc_store::MmapStore;
use pmc_types::error::MergeMissingFile;
use pmc_types::key;
use pmc_types::layout;
use pmc_types::{GaugeMode, Metric, MetricType, Sample};

pub struct MergeEngine;

impl MergeEngine {
    /// Read every file in `files`, fold matching samples into per-metric
    /// accumulators, then apply the per-type aggregation rule (spec.md
    /// §4.4). `accumulate` only affects histograms: `true` emits `_bucket`
    /// samples as running prefix sums plus a `_count` sample (wire
    /// format); `false` emits raw per-bucket sums and no `_count` (safe
    /// for writing straight back into an archive store).
    pub fn merge(files: &[PathBuf], accumulate: bool) -> Result<Vec<Metric>> {
        let mut metrics: HashMap<String, Metric> = HashMap::new();

        for file in files {
            read_into(file, &mut metrics)
                .with_context(|| format!("merging {}", file.display()))?;
        }

        metrics
            .into_values()
            .map(|metric| aggregate(metric, accumulate))
            .collect()
    }
}

fn read_into(file: &Path, metrics: &mut HashMap<String, Metric>) -> Result<()> {
    let (metric_type, mode, pid) = classify_file(file)?;

    if !file.exists() {
        if metric_type == MetricType::Gauge
            && matches!(mode, Some(GaugeMode::LiveSum) | Some(GaugeMode::LiveAll))
        {
            return Ok(());
        }
        return Err(MergeMissingFile {
            path: file.to_path_buf(),
        }
        .into());
    }

    let store = MmapStore::open(file, true)?;
    for entry in store.read_all_values() {
        let (raw_key, value, timestamp) = entry?;
        let (metric_name, sample_name, mut labels) =
            key::parse_key(&raw_key).with_context(|| format!("{}", file.display()))?;

        if let Some(pid) = pid {
            labels.insert("pid".to_string(), pid.to_string());
        }

        let metric = metrics.entry(metric_name.clone()).or_insert_with(|| {
            let mut m = Metric::new(metric_name.clone(), metric_type);
            m.multiprocess_mode = mode;
            m
        });
        metric
            .samples
            .push(Sample::new(sample_name, labels, value).with_timestamp(timestamp));
    }

    Ok(())
}

/// Identify a file's metric type, gauge mode, and (for live worker files)
/// pid from its name. Tries the live-worker grammar first, then falls back
/// to the five fixed archive names.
fn classify_file(path: &Path) -> Result<(MetricType, Option<GaugeMode>, Option<u32>)> {
    if let Ok(info) = layout::classify_live(path) {
        return Ok((info.metric_type, info.mode, Some(info.pid)));
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let (metric_type, mode) = match stem {
        "counter" => (MetricType::Counter, None),
        "histogram" => (MetricType::Histogram, None),
        "gauge_min" => (MetricType::Gauge, Some(GaugeMode::Min)),
        "gauge_max" => (MetricType::Gauge, Some(GaugeMode::Max)),
        "gauge_latest" => (MetricType::Gauge, Some(GaugeMode::Latest)),
        _ => anyhow::bail!("not a metrics file: {}", path.display()),
    };
    Ok((metric_type, mode, None))
}

type GroupKey = (String, BTreeMap<String, String>);

fn without_pid(mut labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels.remove("pid");
    labels
}

fn aggregate(metric: Metric, accumulate: bool) -> Result<Metric> {
    match metric.metric_type {
        MetricType::Counter | MetricType::Summary => Ok(aggregate_sum(metric)),
        MetricType::Gauge => aggregate_gauge(metric),
        MetricType::Histogram => Ok(aggregate_histogram(metric, accumulate)),
    }
}

/// Counter/Summary: sum every sample sharing `(sample_name, labels)`, pid
/// stripped — the filename's pid never belongs in a counter's key, it only
/// existed to tell the per-file writer apart (spec.md §4.4).
fn aggregate_sum(metric: Metric) -> Metric {
    let mut out = Metric::new(metric.name.clone(), metric.metric_type);
    let mut sums: HashMap<GroupKey, f64> = HashMap::new();

    for sample in metric.samples {
        let key = (sample.name, without_pid(sample.labels));
        *sums.entry(key).or_insert(0.0) += sample.value;
    }

    out.samples = sums
        .into_iter()
        .map(|((name, labels), value)| Sample::new(name, labels, value))
        .collect();
    out
}

fn aggregate_gauge(metric: Metric) -> Result<Metric> {
    let mode = metric
        .multiprocess_mode
        .context("gauge metric carries no multiprocess_mode")?;

    let mut out = Metric::new(metric.name.clone(), MetricType::Gauge);
    out.multiprocess_mode = Some(mode);

    out.samples = match mode {
        // `pid` is part of the identity for all/liveall — samples pass through.
        GaugeMode::All | GaugeMode::LiveAll => metric.samples,

        GaugeMode::LiveSum => {
            let mut sums: HashMap<GroupKey, f64> = HashMap::new();
            for sample in metric.samples {
                let key = (sample.name, without_pid(sample.labels));
                *sums.entry(key).or_insert(0.0) += sample.value;
            }
            sums.into_iter()
                .map(|((name, labels), value)| Sample::new(name, labels, value))
                .collect()
        }

        GaugeMode::Min | GaugeMode::Max => {
            let mut acc: HashMap<GroupKey, f64> = HashMap::new();
            for sample in metric.samples {
                let key = (sample.name, without_pid(sample.labels));
                acc.entry(key)
                    .and_modify(|v| {
                        *v = if mode == GaugeMode::Min {
                            v.min(sample.value)
                        } else {
                            v.max(sample.value)
                        }
                    })
                    .or_insert(sample.value);
            }
            acc.into_iter()
                .map(|((name, labels), value)| Sample::new(name, labels, value))
                .collect()
        }

        GaugeMode::Latest => {
            // Tie-break: last-seen-wins. Samples are processed in the
            // order files were passed in and records appear within each
            // file, so this is deterministic for a fixed input file list,
            // not an arbitrary HashMap iteration order. The winning
            // sample's own timestamp (not the comparison sentinel) is
            // carried onto the emitted sample, matching
            // `multiprocess.py`'s `Sample(name, labels, value=s.value,
            // timestamp=s.timestamp)` — dropping it would make an
            // archived `gauge_latest` value decode back to "absent" and
            // always lose a later comparison against an older sample.
            let mut latest: HashMap<GroupKey, (f64, Option<f64>)> = HashMap::new();
            for sample in metric.samples {
                let ts = sample.timestamp.unwrap_or(f64::NEG_INFINITY);
                let key = (sample.name, without_pid(sample.labels));
                let replace = match latest.get(&key) {
                    Some(&(_, existing_ts)) => ts >= existing_ts.unwrap_or(f64::NEG_INFINITY),
                    None => true,
                };
                if replace {
                    latest.insert(key, (sample.value, sample.timestamp));
                }
            }
            latest
                .into_iter()
                .map(|((name, labels), (value, ts))| {
                    Sample::new(name, labels, value).with_timestamp(ts)
                })
                .collect()
        }
    };

    Ok(out)
}

fn parse_bucket_bound(s: &str) -> f64 {
    if s == "+Inf" {
        f64::INFINITY
    } else {
        s.parse().unwrap_or(f64::INFINITY)
    }
}

/// Formats a bucket bound the way a writer using Go-style float formatting
/// would (spec.md §4.4): unlike `strconv.FormatFloat(v, 'g', -1, 64)`,
/// Rust's `Display` for `f64` drops the fractional part entirely for
/// integral values (`1.0` prints as `"1"`, not `"1.0"`), so that bare
/// `format!("{}", v)` has to be patched up with an explicit `.0` whenever
/// the shortest decimal came out with no `.`/`e` in it.
fn format_bucket_bound(v: f64) -> String {
    if v.is_infinite() {
        return "+Inf".to_string();
    }
    let s = format!("{}", v);
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Histogram: bucket samples (labels carrying `le`) are grouped by
/// `labels \ {pid, le}` and summed per distinct bound; `_sum`/`_count` and
/// any other non-bucket sample are grouped by `(sample_name, labels \
/// pid)` and summed. When `accumulate`, the summed bucket values become a
/// running prefix sum and the group's final total *replaces* (not adds
/// to) any `_count` sample already present from an earlier archive pass —
/// this mirrors the original's plain dict assignment
/// `samples[(name + '_count', labels)] = acc`, as opposed to the `+=`
/// used for `_sum`.
fn aggregate_histogram(metric: Metric, accumulate: bool) -> Metric {
    let mut out = Metric::new(metric.name.clone(), MetricType::Histogram);

    let mut buckets: HashMap<BTreeMap<String, String>, HashMap<String, f64>> = HashMap::new();
    let mut others: HashMap<GroupKey, f64> = HashMap::new();

    for sample in metric.samples {
        let mut labels = without_pid(sample.labels);
        if let Some(bound) = labels.remove("le") {
            let group = buckets.entry(labels).or_default();
            *group.entry(bound).or_insert(0.0) += sample.value;
        } else {
            *others.entry((sample.name, labels)).or_insert(0.0) += sample.value;
        }
    }

    for (labels, bucket_sums) in &buckets {
        let mut sorted: Vec<(f64, f64)> = bucket_sums
            .iter()
            .map(|(bound_str, sum)| (parse_bucket_bound(bound_str), *sum))
            .collect();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("bucket bounds are never NaN"));

        let mut running = 0.0;
        for (bound, sum) in &sorted {
            running += sum;
            let emitted = if accumulate { running } else { *sum };
            let mut bucket_labels = labels.clone();
            bucket_labels.insert("le".to_string(), format_bucket_bound(*bound));
            out.samples.push(Sample::new(
                format!("{}_bucket", metric.name),
                bucket_labels,
                emitted,
            ));
        }

        if accumulate {
            others.insert((format!("{}_count", metric.name), labels.clone()), running);
        }
    }

    out.samples
        .extend(others.into_iter().map(|((name, labels), value)| {
            Sample::new(name, labels, value)
        }));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmc_store::MmapStore;
    use tempfile::tempdir;

    fn write_sample(
        path: &Path,
        metric: &str,
        sample: &str,
        labels: &[(&str, &str)],
        value: f64,
        timestamp: Option<f64>,
    ) {
        let label_map: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = key::make_key_from_map(metric, sample, &label_map);
        let mut store = MmapStore::open(path, false).unwrap();
        store.write_value(&key, value, timestamp).unwrap();
    }

    #[test]
    fn counter_sums_across_pids() {
        let dir = tempdir().unwrap();
        let p0 = dir.path().join("counter_0.db");
        let p1 = dir.path().join("counter_1.db");
        // pid 0 incremented by 1 twice; pid 1 incremented by 1 once.
        write_sample(&p0, "c", "c_total", &[], 2.0, None);
        write_sample(&p1, "c", "c_total", &[], 1.0, None);

        let metrics = MergeEngine::merge(&[p0, p1], true).unwrap();
        assert_eq!(metrics.len(), 1);
        let c = &metrics[0];
        assert_eq!(c.samples.len(), 1);
        assert_eq!(c.samples[0].name, "c_total");
        assert_eq!(c.samples[0].value, 3.0);
        assert!(c.samples[0].labels.is_empty());
    }

    #[test]
    fn gauge_all_keeps_every_pid() {
        let dir = tempdir().unwrap();
        let p123 = dir.path().join("gauge_all_123.db");
        let p456 = dir.path().join("gauge_all_456.db");
        write_sample(&p123, "g", "g", &[], 1.0, None);
        write_sample(&p456, "g", "g", &[], 2.0, None);

        let metrics = MergeEngine::merge(&[p123, p456], true).unwrap();
        let g = &metrics[0];
        assert_eq!(g.samples.len(), 2);
        let mut by_pid: Vec<(String, f64)> = g
            .samples
            .iter()
            .map(|s| (s.labels.get("pid").unwrap().clone(), s.value))
            .collect();
        by_pid.sort();
        assert_eq!(
            by_pid,
            vec![("123".to_string(), 1.0), ("456".to_string(), 2.0)]
        );
    }

    #[test]
    fn gauge_liveall_drops_dead_pid_file() {
        let dir = tempdir().unwrap();
        let p456 = dir.path().join("gauge_liveall_456.db");
        write_sample(&p456, "g", "g", &[], 2.0, None);
        // pid 123's file was already unlinked by MarkProcessDead.
        let p123 = dir.path().join("gauge_liveall_123.db");

        let metrics = MergeEngine::merge(&[p123, p456], true).unwrap();
        let g = &metrics[0];
        assert_eq!(g.samples.len(), 1);
        assert_eq!(g.samples[0].labels.get("pid").unwrap(), "456");
    }

    #[test]
    fn histogram_accumulate_true_emits_prefix_sums_and_count() {
        let dir = tempdir().unwrap();
        let p0 = dir.path().join("histogram_0.db");
        let p1 = dir.path().join("histogram_1.db");
        write_sample(&p0, "h", "h_bucket", &[("le", "1.0")], 1.0, None);
        write_sample(&p0, "h", "h_bucket", &[("le", "5.0")], 1.0, None);
        write_sample(&p0, "h", "h_bucket", &[("le", "+Inf")], 1.0, None);
        write_sample(&p0, "h", "h_sum", &[], 1.0, None);

        write_sample(&p1, "h", "h_bucket", &[("le", "1.0")], 0.0, None);
        write_sample(&p1, "h", "h_bucket", &[("le", "5.0")], 1.0, None);
        write_sample(&p1, "h", "h_bucket", &[("le", "+Inf")], 1.0, None);
        write_sample(&p1, "h", "h_sum", &[], 5.0, None);

        let metrics = MergeEngine::merge(&[p0, p1], true).unwrap();
        let h = &metrics[0];

        let bucket = |le: &str| -> f64 {
            h.samples
                .iter()
                .find(|s| s.name == "h_bucket" && s.labels.get("le").map(String::as_str) == Some(le))
                .unwrap()
                .value
        };
        assert_eq!(bucket("1.0"), 1.0);
        assert_eq!(bucket("5.0"), 2.0);
        assert_eq!(bucket("+Inf"), 2.0);

        let count = h.samples.iter().find(|s| s.name == "h_count").unwrap();
        assert_eq!(count.value, 2.0);

        let sum = h.samples.iter().find(|s| s.name == "h_sum").unwrap();
        assert_eq!(sum.value, 6.0);
    }

    #[test]
    fn histogram_accumulate_false_emits_raw_sums_and_no_count() {
        let dir = tempdir().unwrap();
        let p0 = dir.path().join("histogram_0.db");
        let p1 = dir.path().join("histogram_1.db");
        write_sample(&p0, "h", "h_bucket", &[("le", "1.0")], 1.0, None);
        write_sample(&p1, "h", "h_bucket", &[("le", "1.0")], 0.0, None);

        let metrics = MergeEngine::merge(&[p0, p1], false).unwrap();
        let h = &metrics[0];
        assert!(!h.samples.iter().any(|s| s.name == "h_count"));
        let bucket = h.samples.iter().find(|s| s.name == "h_bucket").unwrap();
        assert_eq!(bucket.value, 1.0);
    }

    #[test]
    fn missing_non_live_only_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("counter_1.db");
        let err = MergeEngine::merge(&[missing], true).unwrap_err();
        assert!(err.to_string().contains("merging"));
    }

    #[test]
    fn format_bucket_bound_appends_point_zero_for_integral_values() {
        assert_eq!(format_bucket_bound(1.0), "1.0");
        assert_eq!(format_bucket_bound(5.0), "5.0");
        assert_eq!(format_bucket_bound(0.5), "0.5");
        assert_eq!(format_bucket_bound(f64::INFINITY), "+Inf");
    }

    #[test]
    fn gauge_latest_keeps_winning_sample_timestamp() {
        let dir = tempdir().unwrap();
        let p0 = dir.path().join("gauge_latest_0.db");
        let p1 = dir.path().join("gauge_latest_1.db");
        write_sample(&p0, "g", "g", &[], 1.0, Some(100.0));
        write_sample(&p1, "g", "g", &[], 2.0, Some(200.0));

        let metrics = MergeEngine::merge(&[p0, p1], true).unwrap();
        let g = &metrics[0];
        assert_eq!(g.samples.len(), 1);
        assert_eq!(g.samples[0].value, 2.0);
        assert_eq!(g.samples[0].timestamp, Some(200.0));
    }
}
