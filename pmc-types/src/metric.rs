//! The value objects the core exchanges with the surrounding metrics
//! library: [`Metric`] and [`Sample`]. Defined standalone here (spec.md §9:
//! "they should be defined by the surrounding metrics library, or — if
//! implementing standalone — as simple records with the fields listed in
//! §3"). The core never invokes behavior on them beyond field access and
//! list mutation during merge.

use std::collections::BTreeMap;

/// Tagged variant replacing the dynamic polymorphism over metric type that
/// the original Python implementation gets from duck-typed `Counter`/
/// `Gauge`/`Histogram`/`Summary` classes (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    /// The `<type>` component of a worker/archive file name.
    pub fn file_prefix(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }

    pub fn from_file_prefix(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(MetricType::Counter),
            "gauge" => Some(MetricType::Gauge),
            "histogram" => Some(MetricType::Histogram),
            "summary" => Some(MetricType::Summary),
            _ => None,
        }
    }
}

/// Aggregation policy for a gauge across contributing processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaugeMode {
    Min,
    Max,
    Latest,
    All,
    LiveAll,
    LiveSum,
}

impl GaugeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GaugeMode::Min => "min",
            GaugeMode::Max => "max",
            GaugeMode::Latest => "latest",
            GaugeMode::All => "all",
            GaugeMode::LiveAll => "liveall",
            GaugeMode::LiveSum => "livesum",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "min" => Some(GaugeMode::Min),
            "max" => Some(GaugeMode::Max),
            "latest" => Some(GaugeMode::Latest),
            "all" => Some(GaugeMode::All),
            "liveall" => Some(GaugeMode::LiveAll),
            "livesum" => Some(GaugeMode::LiveSum),
            _ => None,
        }
    }

    /// Gauge modes that are archived when their worker dies (spec.md §3,
    /// §4.5). `all`, `liveall`, and `livesum` are never archived: `all`
    /// because pid identity must survive, `liveall`/`livesum` because they
    /// only ever describe *live* processes and are dropped by
    /// `MarkProcessDead` instead.
    pub fn is_archived(self) -> bool {
        matches!(self, GaugeMode::Min | GaugeMode::Max | GaugeMode::Latest)
    }
}

/// One observation: a sample name, its labels, a value, and an optional
/// timestamp (`None` is the in-memory form of the on-disk `+Inf` sentinel).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: Option<f64>,
}

impl Sample {
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>, value: f64) -> Self {
        Sample {
            name: name.into(),
            labels,
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<f64>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// An in-memory aggregation accumulator, constructed fresh per `Merge`
/// call and discarded after results are returned (spec.md §3).
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub metric_type: MetricType,
    pub multiprocess_mode: Option<GaugeMode>,
    pub samples: Vec<Sample>,
}

impl Metric {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Metric {
            name: name.into(),
            metric_type,
            multiprocess_mode: None,
            samples: Vec::new(),
        }
    }
}
