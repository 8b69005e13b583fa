//! # Overflow Region
//!
//! Values longer than `MAX_INLINE_VALUE` do not fit in a leaf entry. They are
//! written to a sidecar file next to the tree file (`<path>.ovf`) and the
//! leaf keeps an overflow entry with the byte range.
//!
//! ## Allocation
//!
//! ```text
//! offset 0                                               tail
//! │ live │ free │ live │ live │   free   │ live │          │ (unused)
//!        └──────┘             └──────────┘
//!          free list (start -> end), coalesced
//! ```
//!
//! `allocate` takes the first free range large enough (first fit), splitting
//! off any remainder. When no free range fits it appends at `tail`. A
//! released range merges with its neighbours; a free range that reaches the
//! tail shrinks the tail instead of staying in the list.
//!
//! ## Durability
//!
//! Overflow bytes are written and synced before the commit that references
//! them, and ranges are only ever written while unreferenced by any committed
//! root. The committed tail is recorded in the super-block; the free list is
//! not persisted and is rebuilt on open from the ranges reachable from the
//! committed root.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// A byte range `[start, end)` of the overflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverflowRange {
    pub start: u64,
    pub end: u64,
}

impl OverflowRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

#[derive(Debug, Default)]
struct FreeList {
    ranges: BTreeMap<u64, u64>,
    tail: u64,
}

impl FreeList {
    fn allocate(&mut self, len: u64) -> OverflowRange {
        let fit = self
            .ranges
            .iter()
            .find(|(start, end)| *end - *start >= len)
            .map(|(start, end)| (*start, *end));

        match fit {
            Some((start, end)) => {
                self.ranges.remove(&start);
                if end - start > len {
                    self.ranges.insert(start + len, end);
                }
                OverflowRange::new(start, start + len)
            }
            None => {
                let start = self.tail;
                self.tail += len;
                OverflowRange::new(start, self.tail)
            }
        }
    }

    fn release(&mut self, range: OverflowRange) {
        let mut start = range.start;
        let mut end = range.end;

        if let Some((&prev_start, &prev_end)) = self.ranges.range(..start).next_back() {
            if prev_end == start {
                self.ranges.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.ranges.get(&end).copied() {
            self.ranges.remove(&end);
            end = next_end;
        }

        if end == self.tail {
            self.tail = start;
        } else {
            self.ranges.insert(start, end);
        }
    }

    fn free_bytes(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }
}

pub struct OverflowRegion {
    file: File,
    path: PathBuf,
    free: Mutex<FreeList>,
}

impl OverflowRegion {
    /// Opens (or creates) the overflow file. The region starts empty; call
    /// [`rebuild`](Self::rebuild) with the committed layout before use.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open overflow file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            free: Mutex::new(FreeList::default()),
        })
    }

    pub fn allocate(&self, len: u64) -> Result<OverflowRange> {
        ensure!(len > 0, "cannot allocate an empty overflow range");

        let range = self.free.lock().allocate(len);
        trace!(start = range.start, end = range.end, "overflow range allocated");
        Ok(range)
    }

    pub fn release(&self, range: OverflowRange) {
        if range.is_empty() {
            return;
        }
        self.free.lock().release(range);
        trace!(start = range.start, end = range.end, "overflow range released");
    }

    pub fn write_at(&self, range: OverflowRange, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() as u64 == range.len(),
            "overflow write of {} bytes into range of {} bytes",
            data.len(),
            range.len()
        );

        self.file.write_all_at(data, range.start).wrap_err_with(|| {
            format!(
                "failed to write overflow range {}..{} of '{}'",
                range.start,
                range.end,
                self.path.display()
            )
        })
    }

    pub fn read(&self, range: OverflowRange) -> Result<Vec<u8>> {
        let mut data = vec![0u8; range.len() as usize];
        self.file.read_exact_at(&mut data, range.start).wrap_err_with(|| {
            format!(
                "failed to read overflow range {}..{} of '{}'",
                range.start,
                range.end,
                self.path.display()
            )
        })?;
        Ok(data)
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync overflow file '{}'", self.path.display()))
    }

    /// Resets the free list to the gaps between `live` ranges below `tail`.
    pub fn rebuild(&self, live: &mut [OverflowRange], tail: u64) -> Result<()> {
        live.sort_unstable();

        let mut free = FreeList {
            ranges: BTreeMap::new(),
            tail,
        };
        let mut cursor = 0u64;
        for range in live.iter() {
            ensure!(
                range.start >= cursor,
                "overlapping overflow ranges at offset {}",
                range.start
            );
            ensure!(
                range.end <= tail,
                "overflow range {}..{} beyond committed tail {}",
                range.start,
                range.end,
                tail
            );
            if range.start > cursor {
                free.ranges.insert(cursor, range.start);
            }
            cursor = range.end;
        }
        if cursor < tail {
            free.ranges.insert(cursor, tail);
        }

        debug!(
            live = live.len(),
            free_ranges = free.ranges.len(),
            tail,
            "overflow region rebuilt"
        );
        *self.free.lock() = free;
        Ok(())
    }

    pub fn tail(&self) -> u64 {
        self.free.lock().tail
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.lock().free_bytes()
    }

    pub fn free_ranges(&self) -> usize {
        self.free.lock().ranges.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
