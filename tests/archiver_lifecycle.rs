//! End-to-end exercises of the archiver/scrape coordinator against real
//! files on disk, mirroring spec.md §8's concrete scenarios. Unit tests
//! beside each module cover the narrower cases; these drive the full
//! `ArchiveCoordinator` surface the way a deployment actually uses it.

use std::collections::BTreeMap;
use std::path::Path;

use pmc_store::MmapStore;
use prometheus_multiproc::ArchiveCoordinator;
use tempfile::tempdir;

fn write(path: &Path, metric: &str, sample: &str, labels: &[(&str, &str)], value: f64) {
    let label_map: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let key = pmc_types::key::make_key_from_map(metric, sample, &label_map);
    let mut store = MmapStore::open(path, false).unwrap();
    store.write_value(&key, value, None).unwrap();
}

/// A dead worker's counter file is folded into `counter.db` and the
/// original is removed; a live worker's own file is never touched and its
/// value is still reflected by the next scrape (spec.md §8, scenario 1 plus
/// the archival side of §4.5).
#[test]
fn counter_survives_archival_and_rescrape() {
    let dir = tempdir().unwrap();
    let dead_pid = 4_000_111;
    let live_pid = std::process::id();

    write(&dir.path().join(format!("counter_{dead_pid}.db")), "c", "c_total", &[], 2.0);
    write(&dir.path().join(format!("counter_{live_pid}.db")), "c", "c_total", &[], 1.0);

    let coordinator = ArchiveCoordinator::new();
    coordinator.archive_metrics(dir.path(), true, false).unwrap();

    assert!(!dir.path().join(format!("counter_{dead_pid}.db")).exists());
    assert!(dir.path().join(format!("counter_{live_pid}.db")).exists());
    assert!(dir.path().join("counter.db").exists());

    let cached = coordinator.collect_from_cache();
    let total: f64 = cached
        .iter()
        .find(|m| m.name == "c")
        .unwrap()
        .samples
        .iter()
        .find(|s| s.name == "c_total")
        .unwrap()
        .value;
    assert_eq!(total, 3.0);

    // A second worker increments afterward; collect_from_disk must reflect
    // archive (2.0, already folded) plus both live contributions without
    // another archive run.
    write(&dir.path().join(format!("counter_{live_pid}.db")), "c_total_again", "c_total", &[], 5.0);
    let fresh = coordinator.collect_from_disk(dir.path(), true).unwrap();
    let total: f64 = fresh
        .iter()
        .find(|m| m.name == "c")
        .unwrap()
        .samples
        .iter()
        .find(|s| s.name == "c_total")
        .unwrap()
        .value;
    assert_eq!(total, 2.0 + 1.0);
}

/// `mark_process_dead` removes only the liveall/livesum files for that pid;
/// a subsequent archive run's cache no longer carries that pid's liveall
/// sample, while other pids are unaffected (spec.md §8, scenario 3).
#[test]
fn mark_process_dead_then_archive_drops_only_that_pid() {
    let dir = tempdir().unwrap();
    write(&dir.path().join("gauge_liveall_123.db"), "g", "g", &[], 1.0);
    write(&dir.path().join("gauge_liveall_456.db"), "g", "g", &[], 2.0);

    let coordinator = ArchiveCoordinator::new();
    let before = coordinator.collect_from_disk(dir.path(), true).unwrap();
    let g = before.iter().find(|m| m.name == "g").unwrap();
    assert_eq!(g.samples.len(), 2);

    ArchiveCoordinator::mark_process_dead(123, dir.path()).unwrap();

    let after = coordinator.collect_from_disk(dir.path(), true).unwrap();
    let g = after.iter().find(|m| m.name == "g").unwrap();
    assert_eq!(g.samples.len(), 1);
    assert_eq!(g.samples[0].labels.get("pid").unwrap(), "456");
}

/// A full multi-type deployment: counter, gauge (all mode), and histogram
/// samples from two workers, one dead. After archiving, the cached snapshot
/// carries every metric's correctly aggregated result plus the archiver's
/// own self-metric.
#[test]
fn mixed_metric_types_archive_together() {
    let dir = tempdir().unwrap();
    let dead_pid = 4_000_222;
    let live_pid = std::process::id();

    write(&dir.path().join(format!("counter_{dead_pid}.db")), "requests", "requests_total", &[], 10.0);
    write(&dir.path().join(format!("counter_{live_pid}.db")), "requests", "requests_total", &[], 5.0);

    write(&dir.path().join(format!("gauge_all_{dead_pid}.db")), "inflight", "inflight", &[], 3.0);
    write(&dir.path().join(format!("gauge_all_{live_pid}.db")), "inflight", "inflight", &[], 1.0);

    write(&dir.path().join(format!("histogram_{dead_pid}.db")), "latency", "latency_bucket", &[("le", "1.0")], 4.0);
    write(&dir.path().join(format!("histogram_{dead_pid}.db")), "latency", "latency_sum", &[], 4.0);
    write(&dir.path().join(format!("histogram_{live_pid}.db")), "latency", "latency_bucket", &[("le", "1.0")], 1.0);
    write(&dir.path().join(format!("histogram_{live_pid}.db")), "latency", "latency_sum", &[], 1.0);

    let coordinator = ArchiveCoordinator::new();
    coordinator.archive_metrics(dir.path(), true, false).unwrap();

    let snapshot = coordinator.collect_from_cache();

    let requests = snapshot.iter().find(|m| m.name == "requests").unwrap();
    assert_eq!(requests.samples[0].value, 15.0);

    let inflight = snapshot.iter().find(|m| m.name == "inflight").unwrap();
    // `all` mode retains pid identity: dead worker's sample survives in the
    // archive, live worker's sample comes straight from its file.
    assert_eq!(inflight.samples.len(), 2);
    let total: f64 = inflight.samples.iter().map(|s| s.value).sum();
    assert_eq!(total, 4.0);

    let latency = snapshot.iter().find(|m| m.name == "latency").unwrap();
    let bucket = latency
        .samples
        .iter()
        .find(|s| s.name == "latency_bucket")
        .unwrap();
    assert_eq!(bucket.value, 5.0);
    let sum = latency
        .samples
        .iter()
        .find(|s| s.name == "latency_sum")
        .unwrap();
    assert_eq!(sum.value, 5.0);

    assert!(snapshot.iter().any(|m| m.name == "archive_duration_seconds"));
    assert!(coordinator.last_scrape_time().is_some());
}
