//! Shared value types, filename conventions, key codec, and error kinds
//! for the multiprocess metrics core. Kept dependency-light and free of
//! any I/O beyond directory enumeration, the way `pbs-api-types` carries
//! only the shapes the rest of the workspace builds on.

pub mod config;
pub mod error;
pub mod key;
pub mod layout;
pub mod metric;

pub use metric::{GaugeMode, Metric, MetricType, Sample};
