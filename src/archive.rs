//! Periodic archiver and scrape coordinator (spec.md §4.5, §9).
//!
//! Grounded in
//! `examples/original_source/prometheus_client/multiprocess.py`'s
//! `cleanup_dead_processes`/`cleanup_process`/`advisory_lock` trio for the
//! overall algorithm shape (walk for dead pids, take the exclusive lock,
//! merge-and-rewrite each dead pid's files into the archives, delete the
//! originals, then re-merge archives+live under the lock for the cache).
//! The lock primitive itself is [`crate::lock::Lock`]; the atomic-rename
//! archive write is grounded in `pbs-datastore/src/chunk_store.rs`'s
//! write-to-temp-then-rename pattern rather than the original's
//! `tempfile.mktemp()` + `shutil.move` (which may cross filesystems) — the
//! temp file lives beside its destination so the rename is a same-filesystem
//! atomic replace.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;

use pmc_types::{GaugeMode, Metric, MetricType};
use pmc_types::layout;

use crate::cache::MetricsCache;
use crate::lock::Lock;
use crate::merge::MergeEngine;

/// Owns the process-wide [`MetricsCache`] and the operations that read and
/// write it. One instance is expected per process — the archiver task and
/// any in-memory scrape handlers share it (spec.md §4.5, §9).
#[derive(Default)]
pub struct ArchiveCoordinator {
    cache: MetricsCache,
}

impl ArchiveCoordinator {
    pub fn new() -> Self {
        ArchiveCoordinator {
            cache: MetricsCache::new(),
        }
    }

    /// The archiver task (spec.md §4.5, steps 1-7).
    ///
    /// With `aggregate_only = false` (the normal periodic run), dead
    /// workers' files are merged into the per-type archives and unlinked.
    /// With `aggregate_only = true`, that destructive step is skipped
    /// entirely and only the cached snapshot is refreshed — scenario 8 in
    /// spec.md §8 exercises this: a live file survives, but its value is
    /// still reflected in the cache.
    pub fn archive_metrics(&self, root: &Path, blocking: bool, aggregate_only: bool) -> Result<()> {
        let start = Instant::now();

        let live_files = layout::live_worker_files(root)
            .with_context(|| format!("walking {}", root.display()))?;

        let mut dead_pids = Vec::new();
        for file in &live_files {
            let info = match layout::classify_live(file) {
                Ok(info) => info,
                Err(err) => {
                    log::warn!("skipping unparseable worker file: {err}");
                    continue;
                }
            };
            if !is_pid_alive(info.pid) && !dead_pids.contains(&info.pid) {
                dead_pids.push(info.pid);
            }
        }

        let lock = Lock::new(root);
        let _guard = lock.exclusive(blocking)?;

        if aggregate_only {
            log::info!("archive run: aggregate_only, skipping cleanup of {} dead pids", dead_pids.len());
        } else {
            for pid in &dead_pids {
                log::info!("cleaning up worker {pid}");
                cleanup_process(root, *pid)
                    .with_context(|| format!("cleaning up pid {pid}"))?;
            }
        }

        // Live set may have shrunk (dead pids' files unlinked above) or
        // otherwise changed since the first walk, so this is a fresh
        // enumeration, not a reuse of `live_files` (spec.md §4.5 step 5).
        let archive_files: Vec<PathBuf> = layout::archive_paths(root)
            .into_values()
            .filter(|p| p.exists())
            .collect();
        let current_live_files = layout::live_worker_files(root)
            .with_context(|| format!("walking {}", root.display()))?;

        let mut files = archive_files;
        files.extend(current_live_files);

        let metrics = MergeEngine::merge(&files, true)?;
        let elapsed = start.elapsed().as_secs_f64();
        self.cache.store(metrics, elapsed);

        log::info!(
            "archive run complete: {} dead pids cleaned, {:.6}s elapsed",
            if aggregate_only { 0 } else { dead_pids.len() },
            elapsed
        );

        Ok(())
    }

    /// Used by an on-demand `MultiProcessCollector`-style scrape handler:
    /// merges archives plus all live worker files under a shared lock, so
    /// it only ever blocks against an active archiver (spec.md §4.5).
    pub fn collect_from_disk(&self, root: &Path, blocking: bool) -> Result<Vec<Metric>> {
        let lock = Lock::new(root);
        let _guard = lock.shared(blocking)?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in walkdir::WalkDir::new(root)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().map(|ext| ext == "db").unwrap_or(false) {
                files.push(entry.path().to_path_buf());
            }
        }

        MergeEngine::merge(&files, true)
    }

    /// Used by an `InMemoryCollector`-style scrape handler: returns the
    /// cached snapshot with no disk I/O at all. Empty before the first
    /// successful archive run.
    pub fn collect_from_cache(&self) -> Vec<Metric> {
        self.cache.snapshot()
    }

    /// Seconds since the last successful `archive_metrics` run completed,
    /// or `None` if none has.
    pub fn last_scrape_time(&self) -> Option<f64> {
        self.cache.last_scrape_time()
    }

    /// Unlink the `liveall`/`livesum` gauge files for a worker that has
    /// just exited. Idempotent: absent files are not an error (spec.md
    /// §4.5, §7). Called by out-of-scope worker-shutdown hooks.
    pub fn mark_process_dead(pid: u32, root: &Path) -> Result<()> {
        for file in layout::live_only_gauge_files_for_pid(root, pid) {
            safe_remove(&file)?;
        }
        Ok(())
    }
}

/// `kill(pid, 0)`: absence of error means the process is alive (spec.md
/// §4.5). Any error — no such process, no permission to signal it,
/// whatever — is treated as dead, matching the original's bare `except
/// OSError: return False`.
fn is_pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Merge one dead pid's files together with the existing archives
/// (`accumulate=false`, since the result is about to be written straight
/// back to disk, not served over the wire), rewrite the archives, then
/// unlink the pid's source files and its live-only gauge files.
fn cleanup_process(root: &Path, pid: u32) -> Result<()> {
    let worker_files: Vec<PathBuf> = layout::worker_files_for_pid(root, pid)
        .into_iter()
        .filter(|p| p.exists())
        .collect();

    if !worker_files.is_empty() {
        let archive_files: Vec<PathBuf> = layout::archive_paths(root)
            .into_values()
            .filter(|p| p.exists())
            .collect();

        let mut all_files = worker_files.clone();
        all_files.extend(archive_files);

        let metrics = MergeEngine::merge(&all_files, false)?;
        write_archives(root, &metrics)?;

        for file in &worker_files {
            std::fs::remove_file(file)
                .with_context(|| format!("removing {}", file.display()))?;
        }
    }

    for file in layout::live_only_gauge_files_for_pid(root, pid) {
        safe_remove(&file)?;
    }

    Ok(())
}

/// Which archive file a metric's samples belong to, or `None` if this
/// metric type/mode is never archived (summaries, and gauge modes
/// `all`/`liveall`/`livesum` — spec.md §3, §4.5).
fn archive_key(metric: &Metric) -> Option<(MetricType, Option<GaugeMode>)> {
    match metric.metric_type {
        MetricType::Counter => Some((MetricType::Counter, None)),
        MetricType::Histogram => Some((MetricType::Histogram, None)),
        MetricType::Gauge => metric
            .multiprocess_mode
            .filter(|mode| mode.is_archived())
            .map(|mode| (MetricType::Gauge, Some(mode))),
        MetricType::Summary => None,
    }
}

/// Group `metrics` by destination archive file (several metric *names* can
/// share one archive, e.g. two distinct counters both land in
/// `counter.db`) and write each group out as one atomic replace — mirrors
/// the original `_write_metrics`'s `defaultdict`-of-sinks shape, which
/// matters here: writing metric-by-metric with its own temp-file-and-rename
/// would let a later metric's rename clobber an earlier one's.
fn write_archives(root: &Path, metrics: &[Metric]) -> Result<()> {
    let archive_paths = layout::archive_paths(root);
    let mut groups: HashMap<(MetricType, Option<GaugeMode>), Vec<&Metric>> = HashMap::new();

    for metric in metrics {
        if let Some(key) = archive_key(metric) {
            groups.entry(key).or_default().push(metric);
        }
    }

    for (key, group) in groups {
        let Some(dest) = archive_paths.get(&key) else {
            continue;
        };
        write_metrics_to_archive(dest, &group)?;
    }

    Ok(())
}

fn write_metrics_to_archive(dest: &Path, metrics: &[&Metric]) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("archive.db");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    {
        let mut store = pmc_store::MmapStore::open(&tmp_path, false)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        for metric in metrics {
            for sample in &metric.samples {
                let key = pmc_types::key::make_key_from_map(&metric.name, &sample.name, &sample.labels);
                store.write_value(&key, sample.value, sample.timestamp)?;
            }
        }
        store.close()?;
    }

    std::fs::rename(&tmp_path, dest)
        .with_context(|| format!("renaming {} into {}", tmp_path.display(), dest.display()))?;

    Ok(())
}

/// `unlink`, ignoring `ENOENT` — mirrors the original's `_safe_remove`
/// (spec.md §4.5, §7: `MarkProcessDead` never raises on absent files; other
/// OS errors propagate).
fn safe_remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}
