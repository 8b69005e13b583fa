//! # Copy-on-Write B+Tree
//!
//! `BpTree` owns one tree file: the storage engine over it, the free-space
//! bitmap, the overflow region and the committed `(root, sequence)` pair.
//! All reads and writes go through transactions ([`BpTxn`]).
//!
//! ## File Layout
//!
//! ```text
//! page 0                   super-block, two commit slots
//! pages 1 ..= B            bitmap, one bit per page of the file
//! pages B+1 ..             tree nodes, allocated from the bitmap
//! <path>.ovf               overflow values, byte addressed
//! ```
//!
//! ## Versions
//!
//! ```text
//!   committed (root 7, seq 4)            writer's shadows
//!           [7]                              [12]'
//!          /   \           put("k")         /    \
//!        [3]   [5]       ───────────>     [3]    [13]'   <- copies of 7 and 5
//! ```
//!
//! A write transaction never modifies a committed page. Every page it
//! touches is copied to a freshly allocated id first, and the copies are
//! linked into a new root. Readers keep using the old root until they finish;
//! the pages it alone references (7 and 5 above) are retired by the commit
//! and returned to the bitmap once no snapshot older than the commit is
//! still active.
//!
//! ## Commit Protocol
//!
//! ```text
//! 1. overflow values        write + sync the overflow file
//! 2. shadow pages + bitmap  one WriteBatch, then sync
//! 3. super-block slot       slot (seq + 1) % 2, then sync
//! 4. publish                new (root, seq) visible to begin_read
//! ```
//!
//! A failure at any step leaves the previously committed slot authoritative.
//! A crash between 3 and 4 is harmless: the next open reads the newest valid
//! slot.
//!
//! ## Recovery on Open
//!
//! Open picks the newest valid super-block slot, loads the bitmap, then walks
//! every page reachable from the committed root. Pages marked used but not
//! reachable (retired by the last commit before a crash or shutdown) are
//! released, and the overflow free list is rebuilt from the overflow entries
//! found in the walk.
//!
//! ## Concurrency
//!
//! One write transaction at a time (it holds the writer mutex for its whole
//! life); any number of read transactions. `BpTree` is `Send + Sync`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::node::{BpTreeItem, NodeView, NodeViewMut};
use super::overflow::{OverflowRange, OverflowRegion};
use super::txn::{BpTxn, TxnMode};
use crate::config::{DEFAULT_TOTAL_PAGES, NODE_SIZE, OVERFLOW_SUFFIX, SUPERBLOCK_PAGE};
use crate::storage::{
    bitmap_pages, CacheStats, PageBitmap, PageBuf, Storage, StorageConfig, SuperBlock,
};

/// Builder for opening or creating a [`BpTree`].
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    path: Option<PathBuf>,
    total_pages: u64,
    storage: StorageConfig,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self {
            path: None,
            total_pages: DEFAULT_TOTAL_PAGES,
            storage: StorageConfig::default(),
        }
    }
}

impl TreeBuilder {
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// File size in pages, used only when the file is created.
    pub fn total_pages(mut self, pages: u64) -> Self {
        self.total_pages = pages;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.storage.cache_capacity = capacity;
        self
    }

    pub fn io_queue_depth(mut self, depth: usize) -> Self {
        self.storage.io_queue_depth = depth;
        self
    }

    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.storage.direct_io = enabled;
        self
    }

    pub fn open(self) -> Result<BpTree> {
        let path = self
            .path
            .ok_or_else(|| eyre!("tree path not set on builder"))?;

        let exists = path
            .try_exists()
            .wrap_err_with(|| format!("failed to check for '{}'", path.display()))?;
        if exists {
            BpTree::load(path, self.storage)
        } else {
            BpTree::create(path, self.total_pages, self.storage)
        }
    }
}

/// Point-in-time numbers for a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub sequence: u64,
    pub root_page_id: u64,
    pub total_pages: u64,
    pub free_pages: u64,
    pub active_snapshots: usize,
    pub pending_reclaim_pages: usize,
    pub overflow_tail: u64,
    pub overflow_free_bytes: u64,
    pub cache: CacheStats,
}

#[derive(Debug)]
struct Committed {
    root: u64,
    sequence: u64,
    superblock: SuperBlock,
}

#[derive(Debug)]
struct Retired {
    sequence: u64,
    pages: Vec<u64>,
    overflow: Vec<OverflowRange>,
}

pub struct BpTree {
    storage: Storage,
    bitmap: PageBitmap,
    overflow: OverflowRegion,
    committed: Mutex<Committed>,
    superblock_page: Mutex<Box<PageBuf>>,
    writer: Mutex<()>,
    snapshots: Mutex<BTreeMap<u64, usize>>,
    retired: Mutex<Vec<Retired>>,
    poisoned: AtomicBool,
    #[cfg(test)]
    fail_superblock_sync: AtomicBool,
    path: PathBuf,
}

impl std::fmt::Debug for BpTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpTree")
            .field("path", &self.path)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

fn overflow_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(OVERFLOW_SUFFIX);
    PathBuf::from(name)
}

/// Pages and overflow ranges reachable from a root.
struct Reachable {
    pages: Vec<u64>,
    overflow: Vec<OverflowRange>,
}

impl BpTree {
    pub fn builder() -> TreeBuilder {
        TreeBuilder::default()
    }

    /// Opens the tree at `path`, creating it with the default size if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    fn create(path: PathBuf, total_pages: u64, config: StorageConfig) -> Result<Self> {
        let bm_pages = bitmap_pages(total_pages);
        ensure!(
            total_pages >= bm_pages + 2,
            "tree file of {} pages cannot hold super-block, {} bitmap pages and a root",
            total_pages,
            bm_pages
        );

        let storage = Storage::create(&path, total_pages, config)?;

        let bitmap = PageBitmap::new(total_pages);
        for page in SUPERBLOCK_PAGE..=bm_pages {
            bitmap.mark_used(page);
        }
        let root = bitmap
            .find_free_bit()
            .ok_or_else(|| eyre!("page bitmap exhausted while creating root"))?;

        let mut root_page = PageBuf::boxed();
        NodeViewMut::init(root_page.as_mut_slice(), 0, false)?;

        let mut batch = storage.write_batch();
        batch.sched_write(root_page.as_slice(), root)?;
        for (i, chunk) in bitmap.to_bytes().chunks(NODE_SIZE).enumerate() {
            batch.sched_write(chunk, 1 + i as u64)?;
        }
        batch.write_complete()?;
        drop(batch);
        storage.sync()?;

        let mut superblock = SuperBlock::new(total_pages, bm_pages, root);
        let mut superblock_page = PageBuf::boxed();
        superblock.write_to_page(superblock_page.as_mut_slice())?;
        let mut batch = storage.write_batch();
        batch.sched_write(superblock_page.as_slice(), SUPERBLOCK_PAGE)?;
        batch.write_complete()?;
        drop(batch);
        storage.sync()?;

        let overflow = OverflowRegion::open(overflow_path(&path))?;
        overflow.rebuild(&mut [], 0)?;

        debug!(
            path = %path.display(),
            total_pages,
            bitmap_pages = bm_pages,
            root,
            "created tree"
        );

        Ok(Self::assemble(
            storage,
            bitmap,
            overflow,
            superblock,
            superblock_page,
            path,
        ))
    }

    fn load(path: PathBuf, config: StorageConfig) -> Result<Self> {
        let storage = Storage::open(&path, config)?;

        let page0 = storage.load(SUPERBLOCK_PAGE)?;
        let superblock = SuperBlock::from_page(page0.as_slice())
            .wrap_err_with(|| format!("failed to read super-block of '{}'", path.display()))?;
        let mut superblock_page = PageBuf::boxed();
        superblock_page.copy_from_page(page0.as_slice())?;
        drop(page0);

        let total_pages = superblock.total_pages();
        ensure!(
            total_pages == storage.page_count(),
            "super-block records {} pages but '{}' holds {}",
            total_pages,
            path.display(),
            storage.page_count()
        );
        ensure!(
            superblock.bitmap_pages() == bitmap_pages(total_pages),
            "super-block bitmap size {} does not match {} pages",
            superblock.bitmap_pages(),
            total_pages
        );

        let mut raw = Vec::with_capacity(superblock.bitmap_pages() as usize * NODE_SIZE);
        for page in 0..superblock.bitmap_pages() {
            raw.extend_from_slice(storage.load(superblock.bitmap_start() + page)?.as_slice());
        }
        let bitmap = PageBitmap::from_bytes(total_pages, &raw)?;

        let root = superblock.root_page_id();
        let reachable = Self::walk(&storage, root, total_pages, superblock.bitmap_pages())?;

        let mut live = HashSet::with_capacity(reachable.pages.len());
        for &page in &reachable.pages {
            ensure!(
                bitmap.is_set(page),
                "page {} is reachable from root {} but marked free",
                page,
                root
            );
            live.insert(page);
        }
        let mut leaked = 0u64;
        for page in (superblock.bitmap_pages() + 1)..total_pages {
            if bitmap.is_set(page) && !live.contains(&page) {
                bitmap.release_bit(page);
                leaked += 1;
            }
        }
        if leaked > 0 {
            debug!(pages = leaked, "released pages unreachable from committed root");
        }

        let overflow = OverflowRegion::open(overflow_path(&path))?;
        let mut ranges = reachable.overflow;
        overflow.rebuild(&mut ranges, superblock.overflow_tail())?;

        debug!(
            path = %path.display(),
            root,
            sequence = superblock.sequence(),
            pages = reachable.pages.len(),
            "opened tree"
        );

        Ok(Self::assemble(
            storage,
            bitmap,
            overflow,
            superblock,
            superblock_page,
            path,
        ))
    }

    fn assemble(
        storage: Storage,
        bitmap: PageBitmap,
        overflow: OverflowRegion,
        superblock: SuperBlock,
        superblock_page: Box<PageBuf>,
        path: PathBuf,
    ) -> Self {
        Self {
            storage,
            bitmap,
            overflow,
            committed: Mutex::new(Committed {
                root: superblock.root_page_id(),
                sequence: superblock.sequence(),
                superblock,
            }),
            superblock_page: Mutex::new(superblock_page),
            writer: Mutex::new(()),
            snapshots: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(Vec::new()),
            poisoned: AtomicBool::new(false),
            #[cfg(test)]
            fail_superblock_sync: AtomicBool::new(false),
            path,
        }
    }

    fn walk(storage: &Storage, root: u64, total_pages: u64, bm_pages: u64) -> Result<Reachable> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        let mut out = Reachable {
            pages: Vec::new(),
            overflow: Vec::new(),
        };

        while let Some(id) = stack.pop() {
            ensure!(
                id > bm_pages && id < total_pages,
                "tree references page {} outside the node area",
                id
            );
            if !seen.insert(id) {
                bail!("page {} is referenced twice", id);
            }
            out.pages.push(id);

            let page = storage.load(id)?;
            let node = NodeView::from_page(page.as_slice())
                .wrap_err_with(|| format!("corrupt node at page {}", id))?;
            for i in 0..node.num_entries() {
                match node.item(i)? {
                    BpTreeItem::Internal { child, .. } => stack.push(child),
                    BpTreeItem::Overflow { start, end, .. } => {
                        out.overflow.push(OverflowRange::new(start, end))
                    }
                    BpTreeItem::Leaf { .. } => {}
                }
            }
        }

        Ok(out)
    }

    /// Starts a read-only transaction on the latest committed root.
    pub fn begin_read(&self) -> Result<BpTxn<'_>> {
        let (root, sequence) = self.register_snapshot();
        trace!(root, sequence, "read transaction started");
        Ok(BpTxn::new(self, TxnMode::ReadOnly, root, sequence, None))
    }

    /// Starts the write transaction, blocking while another one is active.
    pub fn begin_write(&self) -> Result<BpTxn<'_>> {
        let guard = self.writer.lock();
        ensure!(
            !self.is_poisoned(),
            "tree refuses writes after a failed super-block write; reopen to recover"
        );
        let (root, sequence) = self.register_snapshot();
        trace!(root, sequence, "write transaction started");
        Ok(BpTxn::new(
            self,
            TxnMode::ReadWrite,
            root,
            sequence,
            Some(guard),
        ))
    }

    fn register_snapshot(&self) -> (u64, u64) {
        let committed = self.committed.lock();
        *self.snapshots.lock().entry(committed.sequence).or_insert(0) += 1;
        (committed.root, committed.sequence)
    }

    pub(crate) fn release_snapshot(&self, sequence: u64) {
        {
            let mut snapshots = self.snapshots.lock();
            if let Some(count) = snapshots.get_mut(&sequence) {
                *count -= 1;
                if *count == 0 {
                    snapshots.remove(&sequence);
                }
            }
        }
        self.reclaim();
    }

    /// Writes the next super-block slot and publishes the new root.
    pub(crate) fn publish(&self, root: u64) -> Result<u64> {
        let mut committed = self.committed.lock();
        let mut next = committed
            .superblock
            .next_commit(root, self.overflow.tail());

        {
            let mut page = self.superblock_page.lock();
            next.write_to_page(page.as_mut_slice())?;
            // Past this point the new slot may be on disk whatever the outcome.
            if let Err(e) = self.write_superblock(page.as_slice()) {
                self.poisoned.store(true, Ordering::Release);
                error!(
                    sequence = next.sequence(),
                    error = %e,
                    "super-block write failed, tree is read-only until reopened"
                );
                return Err(e.wrap_err(format!(
                    "failed to publish sequence {}",
                    next.sequence()
                )));
            }
        }

        committed.root = root;
        committed.sequence = next.sequence();
        committed.superblock = next;
        Ok(next.sequence())
    }

    fn write_superblock(&self, page: &[u8]) -> Result<()> {
        let mut batch = self.storage.write_batch();
        batch.sched_write(page, SUPERBLOCK_PAGE)?;
        batch.write_complete()?;
        drop(batch);

        #[cfg(test)]
        {
            if self.fail_superblock_sync.swap(false, Ordering::AcqRel) {
                bail!("injected sync failure");
            }
        }
        self.storage.sync()
    }

    /// Whether a failed super-block write left the on-disk commit unknown.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Queues pages and overflow ranges released by the commit `sequence`.
    pub(crate) fn retire(&self, sequence: u64, pages: Vec<u64>, overflow: Vec<OverflowRange>) {
        if pages.is_empty() && overflow.is_empty() {
            return;
        }
        self.retired.lock().push(Retired {
            sequence,
            pages,
            overflow,
        });
    }

    /// Frees retired pages no active snapshot can still reach.
    fn reclaim(&self) {
        let oldest = self
            .snapshots
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX);

        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let (ready, waiting) = retired.drain(..).partition(|r| r.sequence <= oldest);
            *retired = waiting;
            ready
        };

        for batch in ready {
            trace!(
                sequence = batch.sequence,
                pages = batch.pages.len(),
                "reclaiming retired pages"
            );
            for page in batch.pages {
                self.bitmap.release_bit(page);
            }
            for range in batch.overflow {
                self.overflow.release(range);
            }
        }
    }

    pub fn stats(&self) -> TreeStats {
        let (root, sequence, total_pages) = {
            let committed = self.committed.lock();
            (
                committed.root,
                committed.sequence,
                committed.superblock.total_pages(),
            )
        };

        TreeStats {
            sequence,
            root_page_id: root,
            total_pages,
            free_pages: self.bitmap.free_count(),
            active_snapshots: self.snapshots.lock().values().sum(),
            pending_reclaim_pages: self.retired.lock().iter().map(|r| r.pages.len()).sum(),
            overflow_tail: self.overflow.tail(),
            overflow_free_bytes: self.overflow.free_bytes(),
            cache: self.storage.cache_stats(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.committed.lock().sequence
    }

    pub fn root_page_id(&self) -> u64 {
        self.committed.lock().root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn bitmap(&self) -> &PageBitmap {
        &self.bitmap
    }

    pub(crate) fn overflow(&self) -> &OverflowRegion {
        &self.overflow
    }

    /// Syncs and closes the tree.
    pub fn close(self) -> Result<()> {
        let pending: usize = self.retired.lock().iter().map(|r| r.pages.len()).sum();
        if pending > 0 {
            warn!(
                pages = pending,
                "closing with retired pages still pinned by snapshots"
            );
        }
        self.overflow.sync()?;
        debug!(path = %self.path.display(), "closing tree");
        self.storage.close()
    }
}
