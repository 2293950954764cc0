//! Canonical encoding of `(metric_name, sample_name, labels)` into the
//! textual key stored in an [`MmapStore`](pmc_store) file.
//!
//! The concrete form is a JSON array `[metric_name, sample_name, labels]`
//! with labels serialized as an object whose keys come out sorted (we use
//! a `BTreeMap`, so `serde_json` emits them in sorted order without extra
//! work). This mirrors the original `mmap_key()` in
//! `prometheus_client/mmap_dict.py`, which builds the same shape via
//! `json.dumps([...], sort_keys=True)`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

/// Build the on-disk key for `(metric_name, sample_name, labels)`.
///
/// `label_names` and `label_values` are zipped positionally, the way the
/// original `mmap_key(metric_name, name, labelnames, labelvalues)` does —
/// callers don't need to pre-sort them, the codec does that.
pub fn make_key<S: AsRef<str>>(
    metric_name: &str,
    sample_name: &str,
    label_names: &[S],
    label_values: &[S],
) -> String {
    let labels: BTreeMap<&str, &str> = label_names
        .iter()
        .map(AsRef::as_ref)
        .zip(label_values.iter().map(AsRef::as_ref))
        .collect();
    make_key_from_map(metric_name, sample_name, &labels)
}

/// Build the on-disk key from an already-assembled label map.
pub fn make_key_from_map<K, V>(
    metric_name: &str,
    sample_name: &str,
    labels: &BTreeMap<K, V>,
) -> String
where
    K: AsRef<str> + Ord + serde::Serialize,
    V: AsRef<str> + serde::Serialize,
{
    // A plain tuple serializes as a JSON array; BTreeMap serializes with
    // its keys already in sorted order.
    serde_json::to_string(&(metric_name, sample_name, labels))
        .expect("metric_name/sample_name/labels are always valid JSON")
}

/// Inverse of [`make_key`] / [`make_key_from_map`].
pub fn parse_key(key: &str) -> Result<(String, String, BTreeMap<String, String>)> {
    serde_json::from_str(key).context("malformed mmap store key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_labels() {
        let key = make_key("http_requests", "http_requests_total", &["path", "method"], &["/", "GET"]);
        let (metric, sample, labels) = parse_key(&key).unwrap();
        assert_eq!(metric, "http_requests");
        assert_eq!(sample, "http_requests_total");
        assert_eq!(labels.get("path").unwrap(), "/");
        assert_eq!(labels.get("method").unwrap(), "GET");
    }

    #[test]
    fn insertion_order_does_not_affect_key() {
        let k1 = make_key("m", "s", &["b", "a"], &["2", "1"]);
        let k2 = make_key("m", "s", &["a", "b"], &["1", "2"]);
        assert_eq!(k1, k2);
    }

    #[test]
    fn no_labels_round_trips() {
        let empty: [&str; 0] = [];
        let key = make_key("c", "c_total", &empty, &empty);
        let (metric, sample, labels) = parse_key(&key).unwrap();
        assert_eq!(metric, "c");
        assert_eq!(sample, "c_total");
        assert!(labels.is_empty());
    }
}
