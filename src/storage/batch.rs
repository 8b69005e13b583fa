//! # Write Batch
//!
//! A `WriteBatch` accumulates full-page writes and flushes them as one unit
//! through the I/O queue.
//!
//! ## Lifecycle
//!
//! ```text
//! storage.write_batch()          create, bound to one Storage
//!   └─ sched_write(bytes, s)     copy the page into a batch-owned buffer
//!   └─ sched_write(bytes, t)     ... any number of distinct sectors
//!   └─ write_complete()          pin, submit all, wait all, unpin,
//!                                then write through to the cache
//! drop(batch)                    release buffers and any leftover pins
//! ```
//!
//! ## Ordering and Durability
//!
//! All writes of a batch are submitted before any is awaited, so they run
//! concurrently on the I/O workers in no particular order. `write_complete`
//! returning `Ok` means every write reached the file; it does not mean they
//! are durable. Callers that need a barrier follow it with
//! [`Storage::sync`](super::Storage::sync).
//!
//! ## Failure
//!
//! The first failing write is reported as the batch's error after every
//! request has completed. Writes that did succeed are not rolled back. Any
//! cached copy of a sector in the batch is invalidated, since the file may
//! now hold either version.
//!
//! ## Cache Coherency
//!
//! On success the written buffers replace whatever the cache held for those
//! sectors. A page id freed and reused by a later transaction therefore never
//! serves stale bytes from an earlier incarnation.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::engine::Storage;
use super::page::PageBuf;
use crate::config::NODE_SIZE;

pub struct WriteBatch<'a> {
    storage: &'a Storage,
    writes: Vec<(u64, Arc<PageBuf>)>,
    pinned: SmallVec<[u64; 16]>,
}

impl<'a> WriteBatch<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            writes: Vec::new(),
            pinned: SmallVec::new(),
        }
    }

    /// Queues a copy of `page` for writing at `sector`.
    pub fn sched_write(&mut self, page: &[u8], sector: u64) -> Result<()> {
        ensure!(
            page.len() == NODE_SIZE,
            "invalid page size: {} != {}",
            page.len(),
            NODE_SIZE
        );
        ensure!(
            sector < self.storage.page_count(),
            "sector {} out of bounds (page_count={})",
            sector,
            self.storage.page_count()
        );

        let mut buf = self.storage.cache().lock().take_buffer();
        match Arc::get_mut(&mut buf) {
            Some(owned) => owned.copy_from_page(page)?,
            None => {
                let mut fresh = PageBuf::zeroed();
                fresh.copy_from_page(page)?;
                buf = Arc::new(fresh);
            }
        }

        self.writes.push((sector, buf));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Submits every scheduled write and blocks until all have completed.
    pub fn write_complete(&mut self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }

        {
            let mut cache = self.storage.cache().lock();
            for (sector, _) in &self.writes {
                if cache.pin(*sector) {
                    self.pinned.push(*sector);
                }
            }
        }

        let mut tickets = Vec::with_capacity(self.writes.len());
        let mut first_error = None;
        for (sector, buf) in &self.writes {
            match self.storage.io().submit_write(*sector, Arc::clone(buf)) {
                Ok(ticket) => tickets.push(ticket),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        for ticket in tickets {
            let done = ticket.wait();
            if let Err(e) = done.result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        let writes = std::mem::take(&mut self.writes);
        let mut cache = self.storage.cache().lock();
        for sector in self.pinned.drain(..) {
            cache.unpin(sector);
        }

        match first_error {
            None => {
                debug!(pages = writes.len(), "write batch complete");
                for (sector, buf) in writes {
                    cache.replace(sector, buf);
                }
                Ok(())
            }
            Some(e) => {
                warn!(pages = writes.len(), error = %e, "write batch failed");
                for (sector, _) in &writes {
                    cache.invalidate(*sector);
                }
                Err(e)
            }
        }
    }
}

impl Drop for WriteBatch<'_> {
    fn drop(&mut self) {
        if !self.pinned.is_empty() {
            let mut cache = self.storage.cache().lock();
            for sector in self.pinned.drain(..) {
                cache.unpin(sector);
            }
        }

        if !self.writes.is_empty() {
            let mut cache = self.storage.cache().lock();
            for (_, buf) in self.writes.drain(..) {
                cache.recycle(buf);
            }
        }
    }
}
