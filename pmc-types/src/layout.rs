//! Filename conventions for worker, archive, and lock files.
//!
//! Grounded in `pbs-tools/src/fs.rs`'s `scandir`/`scan_subdir` pattern of
//! driving directory enumeration off a `regex::Regex`, and in
//! `pbs-datastore`'s use of `walkdir` for flat directory walks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::BadName;
use crate::metric::{GaugeMode, MetricType};

/// `^(\w+)_(\d+)\.db$` — matches any live worker file. `\w+` is greedy, so
/// for `gauge_min_123.db` it first grabs everything, then backtracks just
/// enough to let `_(\d+)\.db` match the trailing `_123.db`, leaving
/// `gauge_min` as the base. This mirrors the original's
/// `re.compile(r"(\w+)_(\d+)\.db")`.
fn live_file_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+)_(\d+)\.db$").unwrap())
}

/// Enumerate all live-worker `.db` files directly under `root`.
///
/// Non-recursive: worker files are never nested. Unknown/non-matching
/// filenames are silently ignored, per spec.md §6 ("Unknown filenames are
/// ignored by enumeration").
pub fn live_worker_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if live_file_pattern().is_match(name) {
            out.push(entry.path().to_path_buf());
        }
    }
    Ok(out)
}

/// The five fixed archive paths, keyed by `(type, mode)` — `mode` is only
/// ever `Some` for gauges, and only for the three archived modes.
pub fn archive_paths(root: &Path) -> HashMap<(MetricType, Option<GaugeMode>), PathBuf> {
    let mut map = HashMap::new();
    map.insert((MetricType::Counter, None), root.join("counter.db"));
    map.insert((MetricType::Histogram, None), root.join("histogram.db"));
    for mode in [GaugeMode::Latest, GaugeMode::Min, GaugeMode::Max] {
        map.insert(
            (MetricType::Gauge, Some(mode)),
            root.join(format!("gauge_{}.db", mode.as_str())),
        );
    }
    map
}

pub fn lockfile_path(root: &Path) -> PathBuf {
    root.join("lockfile")
}

/// Parsed identity of a live worker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFileInfo {
    pub metric_type: MetricType,
    pub mode: Option<GaugeMode>,
    pub pid: u32,
}

/// Parse a worker file's name into its metric type, optional gauge mode,
/// and pid. Fails with [`BadName`] on anything that doesn't fit the
/// grammar — never fatal to the caller (spec.md §7).
pub fn classify_live(path: &Path) -> Result<LiveFileInfo, BadName> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BadName {
            name: path.display().to_string(),
        })?;

    let caps = live_file_pattern().captures(name).ok_or_else(|| BadName {
        name: name.to_string(),
    })?;
    let base = &caps[1];
    let pid: u32 = caps[2].parse().map_err(|_| BadName {
        name: name.to_string(),
    })?;

    let mut parts = base.splitn(2, '_');
    let type_part = parts.next().unwrap_or_default();
    let mode_part = parts.next();

    let metric_type = MetricType::from_file_prefix(type_part).ok_or_else(|| BadName {
        name: name.to_string(),
    })?;

    let mode = match (metric_type, mode_part) {
        (MetricType::Gauge, Some(m)) => {
            Some(GaugeMode::from_str(m).ok_or_else(|| BadName {
                name: name.to_string(),
            })?)
        }
        (MetricType::Gauge, None) => {
            return Err(BadName {
                name: name.to_string(),
            })
        }
        (_, None) => None,
        (_, Some(_)) => {
            return Err(BadName {
                name: name.to_string(),
            })
        }
    };

    Ok(LiveFileInfo {
        metric_type,
        mode,
        pid,
    })
}

/// The exhaustive set of per-pid files the archiver cares about when
/// retiring a dead worker: counter, histogram, the three archived gauge
/// modes, plus the two live-only gauge files (which may or may not exist
/// by the time they're checked — see `mark_process_dead`). Summary files
/// are intentionally absent: the upstream format this crate mirrors never
/// archives summaries (there is no `summary.db` in [`archive_paths`]),
/// so a dead worker's summary samples are simply dropped, matching
/// `examples/original_source/prometheus_client/multiprocess.py::cleanup_process`.
pub fn worker_files_for_pid(root: &Path, pid: u32) -> Vec<PathBuf> {
    vec![
        root.join(format!("counter_{pid}.db")),
        root.join(format!("histogram_{pid}.db")),
        root.join(format!("gauge_latest_{pid}.db")),
        root.join(format!("gauge_min_{pid}.db")),
        root.join(format!("gauge_max_{pid}.db")),
    ]
}

/// The two live-only gauge files removed by `mark_process_dead`.
pub fn live_only_gauge_files_for_pid(root: &Path, pid: u32) -> Vec<PathBuf> {
    vec![
        root.join(format!("gauge_liveall_{pid}.db")),
        root.join(format!("gauge_livesum_{pid}.db")),
    ]
}
