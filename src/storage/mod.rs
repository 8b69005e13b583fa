//! # Storage Module
//!
//! This module provides the page-oriented storage layer underneath the
//! B+tree: a fixed-size file of `NODE_SIZE` sectors, an LRU page cache with
//! hash-chained lookup, asynchronous queue-based I/O, batched writes, the
//! free-space bitmap and the super-block.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   load ────────>│           Storage            │<──── write_batch
//!   prefetch ────>│  ┌────────────────────────┐  │
//!                 │  │ Mutex<PageCache>       │  │  hash chains + LRU list
//!                 │  └───────────┬────────────┘  │  + buffer pool
//!                 │              │ miss / write  │
//!                 │  ┌───────────v────────────┐  │
//!                 │  │ IoQueue (N workers)    │  │  submit / complete
//!                 │  └───────────┬────────────┘  │
//!                 │  ┌───────────v────────────┐  │
//!                 │  │ PageFile (pread/pwrite)│  │  optional O_DIRECT
//!                 │  └────────────────────────┘  │
//!                 └──────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! sector 0                      super-block (two commit slots)
//! sectors 1 ..= bitmap_pages    free-space bitmap, one bit per sector
//! remaining sectors             B+tree nodes
//! ```
//!
//! The file is sized at creation and does not grow. Running out of free bits
//! in the bitmap is a resource-exhaustion error for the caller.
//!
//! ## Module Organization
//!
//! - `page`: `PageBuf` (aligned page buffer) and `PageType`
//! - `file`: `PageFile`, positional sector I/O
//! - `io`: `IoQueue`, worker pool with ticket and callback completion
//! - `cache`: `PageCache`, strict LRU with pinning
//! - `engine`: `Storage`, load / prefetch / sync
//! - `batch`: `WriteBatch`, grouped writes with cache write-through
//! - `bitmap`: `PageBitmap`, lock-free page allocator
//! - `headers`: `SuperBlock`, dual-slot commit record
//!
//! ## Thread Safety
//!
//! `Storage` is `Send + Sync`. The cache is the only structure shared by the
//! load path and the write-completion path and sits behind one mutex. The
//! bitmap is lock-free.

mod batch;
mod bitmap;
mod cache;
mod engine;
mod file;
mod headers;
mod io;
mod page;

pub use batch::WriteBatch;
pub use bitmap::{bitmap_bound, bitmap_pages, PageBitmap};
pub use cache::{CacheStats, PageCache};
pub use engine::{Storage, StorageConfig};
pub use file::PageFile;
pub use headers::{SuperBlock, CURRENT_VERSION, SUPERBLOCK_MAGIC};
pub use io::{IoCallback, IoCompletion, IoKind, IoQueue, IoStats, IoTicket};
pub use page::{PageBuf, PageType};
