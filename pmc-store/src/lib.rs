//! Append-only, mmap-backed `(value, timestamp)` store.
//!
//! This is the one crate in the workspace that touches raw memory: the
//! on-disk format and growth behavior are ported from
//! `examples/original_source/prometheus_client/mmap_dict.py`, and the mmap
//! lifecycle (pointer ownership, `Drop` unmapping, `unsafe impl Send`) is
//! grounded in `pbs-datastore/src/fixed_index.rs`.

mod store;

pub use store::MmapStore;
