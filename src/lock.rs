//! Advisory file lock serializing the archiver's destructive work against
//! concurrent scrapes (spec.md §4.5, §5).
//!
//! Grounded in `pbs-tools/src/process_locker.rs` for the RAII guard shape
//! (a `Drop` impl releases the lock on every exit path, including panics
//! unwinding through the critical section) but built on
//! `nix::fcntl::flock` rather than `process_locker.rs`'s fcntl record
//! locks, following the precedent in `src/tools.rs::lock_file` and
//! `tape/media_catalog.rs`. fcntl record locks are scoped per *process*:
//! a second `LockShared` call from the same process on an already
//! fcntl-held file is a no-op against itself, so one process could never
//! hold two independent shared locks concurrently — but that's exactly
//! what concurrent scrape handlers sharing a process need (spec.md §8,
//! scenario 7). `flock` locks are scoped per open file description, so
//! each `Lock::shared`/`exclusive` call opens its own fd and gets its own
//! independent hold.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Result;
use nix::fcntl::{flock, FlockArg};

use pmc_types::error::LockBusy;
use pmc_types::layout;

/// A handle to `<root>/lockfile`. Carries only the path — every
/// `shared()`/`exclusive()` call opens a fresh file descriptor, so a
/// single `Lock` (or clones of it) can be used concurrently from many
/// call sites within one process.
#[derive(Debug, Clone)]
pub struct Lock {
    path: PathBuf,
}

impl Lock {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Lock {
            path: layout::lockfile_path(root.as_ref()),
        }
    }

    fn open(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
    }

    /// Acquire a shared (scraper) hold. When `blocking` is false, fails
    /// fast with [`LockBusy`] if an exclusive holder is active.
    pub fn shared(&self, blocking: bool) -> Result<SharedGuard> {
        let file = self.open()?;
        let arg = if blocking {
            FlockArg::LockShared
        } else {
            FlockArg::LockSharedNonblock
        };
        acquire(&file, arg)?;
        Ok(SharedGuard { file })
    }

    /// Acquire the exclusive (archiver) hold. When `blocking` is false,
    /// fails fast with [`LockBusy`] if any holder — shared or exclusive —
    /// is active.
    pub fn exclusive(&self, blocking: bool) -> Result<ExclusiveGuard> {
        let file = self.open()?;
        let arg = if blocking {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockExclusiveNonblock
        };
        acquire(&file, arg)?;
        Ok(ExclusiveGuard { file })
    }
}

fn acquire(file: &File, arg: FlockArg) -> Result<()> {
    flock(file.as_raw_fd(), arg).map_err(|err| {
        if matches!(err, nix::Error::EAGAIN | nix::Error::EWOULDBLOCK) {
            anyhow::Error::new(LockBusy)
        } else {
            anyhow::Error::new(err).context("flock failed")
        }
    })
}

/// Released on `Drop`, so a panic or early return inside the critical
/// section still frees the lock.
pub struct SharedGuard {
    file: File,
}

/// Released on `Drop`.
pub struct ExclusiveGuard {
    file: File,
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            log::warn!("failed to release shared lock: {err}");
        }
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            log::warn!("failed to release exclusive lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusive_then_nonblocking_shared_is_busy() {
        let dir = tempdir().unwrap();
        let lock = Lock::new(dir.path());
        let _guard = lock.exclusive(true).unwrap();
        let err = lock.shared(false).unwrap_err();
        assert!(err.downcast_ref::<LockBusy>().is_some());
    }

    #[test]
    fn shared_then_nonblocking_exclusive_is_busy() {
        let dir = tempdir().unwrap();
        let lock = Lock::new(dir.path());
        let _g1 = lock.shared(true).unwrap();
        let _g2 = lock.shared(true).unwrap();
        let err = lock.exclusive(false).unwrap_err();
        assert!(err.downcast_ref::<LockBusy>().is_some());
    }

    #[test]
    fn releasing_exclusive_permits_next_acquirer() {
        let dir = tempdir().unwrap();
        let lock = Lock::new(dir.path());
        {
            let _guard = lock.exclusive(true).unwrap();
        }
        assert!(lock.exclusive(false).is_ok());
    }
}
