//! Error kinds for the multiprocess metrics core.
//!
//! Small `thiserror` enums at module boundaries where callers need to
//! branch on the kind of failure, `anyhow` everywhere else.

use std::path::PathBuf;

/// Errors raised while reading or writing an [`MmapStore`](pmc_store) file.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{path:?} is corrupted: record at offset {offset} extends past `used`")]
    Corruption { path: PathBuf, offset: usize },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mmap error: {0}")]
    Mmap(#[from] nix::Error),
}

/// Filename does not match the `<type>_[<mode>_]<pid>.db` grammar.
#[derive(thiserror::Error, Debug)]
#[error("bad worker file name {name:?}")]
pub struct BadName {
    pub name: String,
}

/// `prometheus_multiproc_dir` is unset, empty, or not a directory.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("prometheus_multiproc_dir is not set")]
    NotSet,
    #[error("prometheus_multiproc_dir {path:?} is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Non-blocking lock acquisition failed because the lock is already held.
#[derive(thiserror::Error, Debug)]
#[error("lock busy")]
pub struct LockBusy;

/// A file required by a merge was missing and wasn't an exempt live-gauge file.
#[derive(thiserror::Error, Debug)]
#[error("merge failed: {path:?} is missing")]
pub struct MergeMissingFile {
    pub path: PathBuf,
}
