//! An append-only dict of `(value, timestamp)` doubles, backed by a
//! memory-mapped file.
//!
//! Grounded in `pbs-datastore/src/fixed_index.rs` for the mmap lifecycle
//! (`nix::sys::mman::{mmap, munmap}`, raw pointer into the mapping,
//! `Drop` unmaps, `unsafe impl Send` because the pointer is not
//! `Send`-by-derive) and in
//! `examples/original_source/prometheus_client/mmap_dict.py` for the exact
//! on-disk record format and growth behavior this port must reproduce
//! byte-for-byte.
//!
//! # File format
//!
//! ```text
//! offset 0:  i32 used        (little-endian, includes this header)
//! offset 4:  4 bytes padding
//! offset 8:  first record
//!   i32 key_len
//!   key_len bytes of UTF-8 key
//!   pad bytes of spaces, pad = 8 - ((key_len + 4) % 8), so pad is in 1..=8
//!   f64 value
//!   f64 timestamp            (+Inf encodes "no timestamp")
//! ...
//! ```

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use pmc_types::error::StoreError;

const INITIAL_CAPACITY: usize = 1 << 20;
const HEADER_SIZE: usize = 8;
const VALUE_PAIR_SIZE: usize = 16;

/// A single `MmapStore` file. Not thread-safe — the single-writer-per-file
/// contract (spec §5) is the caller's responsibility; `MmapStore` itself
/// just never synchronizes internally.
pub struct MmapStore {
    path: PathBuf,
    file: File,
    read_only: bool,
    map: *mut u8,
    capacity: usize,
    used: usize,
    positions: HashMap<String, usize>,
}

// The mapping is process-shared memory, not a thread-local resource, so
// moving the handle across threads is sound; it is never accessed from two
// threads at once in this crate (see module doc), so we stop at `Send`.
unsafe impl Send for MmapStore {}

impl Drop for MmapStore {
    fn drop(&mut self) {
        if !self.map.is_null() {
            if let Err(err) = unsafe { munmap(self.map as *mut std::ffi::c_void, self.capacity) } {
                log::error!("failed to unmap {:?}: {}", self.path, err);
            }
            self.map = std::ptr::null_mut();
        }
    }
}

impl MmapStore {
    /// Open (creating if necessary and `read_only` is false) the store at
    /// `path`.
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?
        };

        let mut capacity = file.metadata()?.len() as usize;
        if capacity == 0 {
            ftruncate(file.as_raw_fd(), INITIAL_CAPACITY as i64)
                .map_err(StoreError::from)?;
            capacity = INITIAL_CAPACITY;
        }

        let map = Self::map_file(&file, capacity, read_only)?;

        let mut store = MmapStore {
            path,
            file,
            read_only,
            map,
            capacity,
            used: 0,
            positions: HashMap::new(),
        };

        let used = store.read_used();
        if used == 0 {
            store.used = HEADER_SIZE;
            if !read_only {
                store.write_used(HEADER_SIZE);
            }
        } else {
            store.used = used;
            store.positions = store.scan_positions()?;
            log::debug!(
                "opened {:?}: {} entries, {} bytes used of {} capacity",
                store.path,
                store.positions.len(),
                store.used,
                store.capacity
            );
        }

        Ok(store)
    }

    fn map_file(file: &File, capacity: usize, read_only: bool) -> Result<*mut u8, StoreError> {
        let prot = if read_only {
            ProtFlags::PROT_READ
        } else {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        };
        let len = NonZeroUsize::new(capacity)
            .ok_or_else(|| StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty store file",
            )))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                prot,
                MapFlags::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(StoreError::from)?;
        Ok(ptr as *mut u8)
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map, self.capacity) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.map, self.capacity) }
    }

    fn read_used(&self) -> usize {
        let b = &self.bytes()[0..4];
        i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
    }

    fn write_used(&mut self, used: usize) {
        let bytes = (used as i32).to_le_bytes();
        self.bytes_mut()[0..4].copy_from_slice(&bytes);
    }

    /// Walk the file from offset 8 to `used`, building the `key -> value
    /// pair offset` index. Used on `Open` of a non-empty file.
    fn scan_positions(&self) -> Result<HashMap<String, usize>, StoreError> {
        let mut positions = HashMap::new();
        for entry in self.iter_records() {
            let (key, _value, _ts, value_offset) = entry?;
            positions.insert(key, value_offset);
        }
        Ok(positions)
    }

    fn iter_records(&self) -> RecordIter<'_> {
        RecordIter {
            store: self,
            pos: HEADER_SIZE,
        }
    }

    /// Append a fresh record for `key` initialized to `(0.0, +Inf)`,
    /// growing the backing file first if needed. Returns the offset of the
    /// value pair.
    fn init_value(&mut self, key: &str) -> Result<usize, StoreError> {
        debug_assert!(!self.read_only, "cannot write to a read-only store");

        let encoded = key.as_bytes();
        let pad = 8 - ((encoded.len() + 4) % 8);
        let record_size = 4 + encoded.len() + pad + VALUE_PAIR_SIZE;

        if self.used + record_size > self.capacity {
            self.grow(self.used + record_size)?;
        }

        let mut record = Vec::with_capacity(record_size);
        record.extend_from_slice(&(encoded.len() as i32).to_le_bytes());
        record.extend_from_slice(encoded);
        record.extend(std::iter::repeat(b' ').take(pad));
        record.extend_from_slice(&0.0f64.to_le_bytes());
        record.extend_from_slice(&f64::INFINITY.to_le_bytes());
        debug_assert_eq!(record.len(), record_size);

        let start = self.used;
        self.bytes_mut()[start..start + record_size].copy_from_slice(&record);

        let value_offset = start + 4 + encoded.len() + pad;
        self.used += record_size;
        // The record must be fully in place before `used` advances, so a
        // concurrent reader that observes the new `used` never reads into
        // bytes we haven't written yet.
        self.write_used(self.used);

        self.positions.insert(key.to_string(), value_offset);
        Ok(value_offset)
    }

    /// Double `capacity` until it can hold `min_capacity` bytes, then
    /// truncate the file and remap.
    fn grow(&mut self, min_capacity: usize) -> Result<(), StoreError> {
        let mut new_capacity = self.capacity;
        while new_capacity < min_capacity {
            new_capacity *= 2;
        }

        ftruncate(self.file.as_raw_fd(), new_capacity as i64).map_err(StoreError::from)?;

        unsafe { munmap(self.map as *mut std::ffi::c_void, self.capacity) }
            .map_err(StoreError::from)?;
        self.map = Self::map_file(&self.file, new_capacity, self.read_only)?;
        self.capacity = new_capacity;

        log::debug!("grew {:?} to {} bytes", self.path, self.capacity);

        Ok(())
    }

    /// Write `(value, timestamp)` for `key`, creating the entry if it does
    /// not exist yet. The 16-byte pair is overwritten with a single slice
    /// assignment so concurrent readers only ever observe the old or the
    /// new pair, never a torn one (best effort — see module doc and
    /// spec.md §9 on platforms lacking 16-byte atomic stores).
    pub fn write_value(
        &mut self,
        key: &str,
        value: f64,
        timestamp: Option<f64>,
    ) -> Result<(), StoreError> {
        let pos = match self.positions.get(key) {
            Some(&pos) => pos,
            None => self.init_value(key)?,
        };

        let mut pair = [0u8; VALUE_PAIR_SIZE];
        pair[0..8].copy_from_slice(&value.to_le_bytes());
        pair[8..16].copy_from_slice(&timestamp.unwrap_or(f64::INFINITY).to_le_bytes());
        self.bytes_mut()[pos..pos + VALUE_PAIR_SIZE].copy_from_slice(&pair);

        Ok(())
    }

    /// Read `(value, timestamp)` for `key`. If `key` has never been
    /// written, it is allocated (to `(0.0, +Inf)`) and `(0.0, None)` is
    /// returned directly, without a redundant read of what was just
    /// written.
    pub fn read_value_timestamp(&mut self, key: &str) -> Result<(f64, Option<f64>), StoreError> {
        let pos = match self.positions.get(key) {
            Some(&pos) => pos,
            None => {
                self.init_value(key)?;
                return Ok((0.0, None));
            }
        };
        let bytes = &self.bytes()[pos..pos + VALUE_PAIR_SIZE];
        let value = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let ts = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
        Ok((value, decode_timestamp(ts)))
    }

    /// Iterate all `(key, value, timestamp)` triples in append order.
    /// Fails with [`StoreError::Corruption`] if any record's declared
    /// length runs past `used`.
    pub fn read_all_values(
        &self,
    ) -> impl Iterator<Item = Result<(String, f64, Option<f64>), StoreError>> + '_ {
        self.iter_records()
            .map(|r| r.map(|(key, value, ts, _pos)| (key, value, ts)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Unmap and close explicitly (equivalent to dropping, but lets
    /// callers observe I/O errors from the final unmap).
    pub fn close(mut self) -> Result<(), StoreError> {
        if !self.map.is_null() {
            unsafe { munmap(self.map as *mut std::ffi::c_void, self.capacity) }
                .map_err(StoreError::from)?;
            self.map = std::ptr::null_mut();
        }
        Ok(())
    }
}

fn decode_timestamp(raw: f64) -> Option<f64> {
    if raw == f64::INFINITY {
        None
    } else {
        Some(raw)
    }
}

struct RecordIter<'a> {
    store: &'a MmapStore,
    pos: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<(String, f64, Option<f64>, usize), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.store.used {
            return None;
        }

        let data = self.store.bytes();
        let key_len =
            i32::from_le_bytes(data[self.pos..self.pos + 4].try_into().unwrap()) as usize;

        if self.pos + 4 + key_len > self.store.used {
            return Some(Err(StoreError::Corruption {
                path: self.store.path.clone(),
                offset: self.pos,
            }));
        }

        let key_start = self.pos + 4;
        let key = match std::str::from_utf8(&data[key_start..key_start + key_len]) {
            Ok(s) => s.to_string(),
            Err(_) => {
                return Some(Err(StoreError::Corruption {
                    path: self.store.path.clone(),
                    offset: self.pos,
                }))
            }
        };

        let pad = 8 - ((key_len + 4) % 8);
        let value_offset = key_start + key_len + pad;

        if value_offset + VALUE_PAIR_SIZE > self.store.used {
            return Some(Err(StoreError::Corruption {
                path: self.store.path.clone(),
                offset: self.pos,
            }));
        }

        let value = f64::from_le_bytes(
            data[value_offset..value_offset + 8].try_into().unwrap(),
        );
        let ts = f64::from_le_bytes(
            data[value_offset + 8..value_offset + 16].try_into().unwrap(),
        );

        self.pos = value_offset + VALUE_PAIR_SIZE;

        Some(Ok((key, value, decode_timestamp(ts), value_offset)))
    }
}
