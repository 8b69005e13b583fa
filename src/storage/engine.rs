//! # Storage Engine
//!
//! `Storage` ties the page file, the I/O queue and the LRU cache together
//! into the synchronous load / asynchronous write surface the B+tree uses.
//!
//! ## Load Path
//!
//! ```text
//! load(sector)
//!   │
//!   ├── cache.lookup(sector) ── hit ──> promote to MRU, return Arc<PageBuf>
//!   │
//!   └── miss
//!         ├── cache.take_buffer()            (pooled buffer, uniquely owned)
//!         ├── io.submit_read(sector, buf)    (queued to a worker)
//!         ├── ticket.wait()                  (blocks until the read lands)
//!         └── cache.install(sector, buf)     (claims the LRU tail slot)
//! ```
//!
//! The cache lock is never held across the wait: two threads missing on the
//! same sector both read it, and `install` keeps whichever copy arrives
//! first.
//!
//! ## Prefetch
//!
//! `prefetch` runs the same read without a waiter. The completion callback
//! executes on the I/O worker and installs the page exactly as a miss-fill
//! would.
//!
//! ## Lifecycle
//!
//! Construction is ordered file, cache, I/O queue. Any step failing drops the
//! pieces already built. Dropping `Storage` shuts the I/O queue down first
//! (draining every submitted request), then releases the cache and closes the
//! file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::batch::WriteBatch;
use super::cache::{CacheStats, PageCache};
use super::file::PageFile;
use super::io::IoQueue;
use super::page::PageBuf;
use crate::config::{DEFAULT_CACHE_CAPACITY, DEFAULT_IO_QUEUE_DEPTH};

/// Runtime knobs for [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    /// Number of page buffers held by the LRU cache.
    pub cache_capacity: usize,
    /// Number of I/O worker threads (maximum requests in flight).
    pub io_queue_depth: usize,
    /// Open the file with `O_DIRECT` (Linux only).
    pub direct_io: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            io_queue_depth: DEFAULT_IO_QUEUE_DEPTH,
            direct_io: false,
        }
    }
}

impl StorageConfig {
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_io_queue_depth(mut self, depth: usize) -> Self {
        self.io_queue_depth = depth;
        self
    }

    pub fn with_direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }
}

pub struct Storage {
    // Dropped first: joins the workers, which hold clones of `cache` and `file`.
    io: IoQueue,
    cache: Arc<Mutex<PageCache>>,
    file: Arc<PageFile>,
    path: PathBuf,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P, config: StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = PageFile::open(path, config.direct_io)?;
        Self::from_file(file, config)
    }

    /// Creates (or truncates) a file of `total_pages` pages and opens it.
    pub fn create<P: AsRef<Path>>(path: P, total_pages: u64, config: StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = PageFile::create(path, total_pages, config.direct_io)?;
        Self::from_file(file, config)
    }

    fn from_file(file: PageFile, config: StorageConfig) -> Result<Self> {
        let path = file.path().to_path_buf();
        let file = Arc::new(file);

        let cache = PageCache::new(config.cache_capacity)
            .wrap_err_with(|| format!("failed to build page cache for '{}'", path.display()))?;
        let io = IoQueue::new(Arc::clone(&file), config.io_queue_depth)
            .wrap_err_with(|| format!("failed to start I/O queue for '{}'", path.display()))?;

        debug!(
            path = %path.display(),
            pages = file.page_count(),
            cache_capacity = config.cache_capacity,
            io_queue_depth = config.io_queue_depth,
            direct_io = config.direct_io,
            "storage opened"
        );

        Ok(Self {
            io,
            cache: Arc::new(Mutex::new(cache)),
            file,
            path,
        })
    }

    fn check_sector(&self, sector: u64) -> Result<()> {
        ensure!(
            sector < self.file.page_count(),
            "sector {} out of bounds (page_count={})",
            sector,
            self.file.page_count()
        );
        Ok(())
    }

    /// Returns the page at `sector`, reading it from disk on a cache miss.
    pub fn load(&self, sector: u64) -> Result<Arc<PageBuf>> {
        self.check_sector(sector)?;

        let buf = {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.lookup(sector) {
                return Ok(hit);
            }
            cache.take_buffer()
        };

        let done = self.io.submit_read(sector, buf)?.wait();
        if let Err(e) = done.result {
            self.cache.lock().recycle(done.buf);
            return Err(e.wrap_err(format!("failed to load sector {}", sector)));
        }

        Ok(self.cache.lock().install(sector, done.buf))
    }

    /// Returns the page at `sector` only if it is already cached.
    pub fn cached(&self, sector: u64) -> Option<Arc<PageBuf>> {
        self.cache.lock().lookup(sector)
    }

    /// Starts reading `sector` into the cache without waiting for it.
    pub fn prefetch(&self, sector: u64) -> Result<()> {
        self.check_sector(sector)?;

        let buf = {
            let mut cache = self.cache.lock();
            if cache.contains(sector) {
                return Ok(());
            }
            cache.take_buffer()
        };

        let cache = Arc::clone(&self.cache);
        self.io.submit_read_with(
            sector,
            buf,
            Box::new(move |done| {
                let mut cache = cache.lock();
                match done.result {
                    Ok(()) => {
                        cache.install(done.sector, done.buf);
                    }
                    Err(e) => {
                        warn!(sector = done.sector, error = %e, "prefetch failed");
                        cache.recycle(done.buf);
                    }
                }
            }),
        )
    }

    /// Starts an empty write batch bound to this storage.
    pub fn write_batch(&self) -> WriteBatch<'_> {
        WriteBatch::new(self)
    }

    /// Flushes written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    pub fn page_count(&self) -> u64 {
        self.file.page_count()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    pub fn is_cached(&self, sector: u64) -> bool {
        self.cache.lock().contains(sector)
    }

    pub(crate) fn cache(&self) -> &Mutex<PageCache> {
        &self.cache
    }

    pub(crate) fn io(&self) -> &IoQueue {
        &self.io
    }

    /// Syncs and releases everything. Dropping without `close` releases the
    /// same resources but skips the final sync.
    pub fn close(self) -> Result<()> {
        self.sync()
            .wrap_err_with(|| format!("failed to sync '{}' on close", self.path.display()))
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.path)
            .field("page_count", &self.file.page_count())
            .field("io_queue_depth", &self.io.depth())
            .finish()
    }
}
