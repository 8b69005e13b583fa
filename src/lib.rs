//! # cowtree - Copy-on-Write B+Tree Storage Engine
//!
//! cowtree is an embedded, single-file ordered key-value store. Keys are
//! byte strings ordered by a caller-supplied comparator and may repeat;
//! values of any size are supported, with large ones stored out of line.
//!
//! - **Copy-on-write**: committed pages are never overwritten, so readers
//!   see a stable snapshot without taking locks on the tree
//! - **Atomic commits**: a two-slot super-block is the only page written in
//!   place; a crash leaves either the old or the new root
//! - **Single writer, many readers**: one write transaction at a time, any
//!   number of concurrent read transactions
//!
//! ## Quick Start
//!
//! ```ignore
//! use cowtree::{BpTree, Lexicographic};
//!
//! let tree = BpTree::builder()
//!     .path("./data.cow")
//!     .total_pages(4096)
//!     .cache_capacity(256)
//!     .open()?;
//!
//! let mut txn = tree.begin_write()?;
//! txn.put(b"user:1", b"alice", &Lexicographic)?;
//! txn.put(b"user:2", b"bob", &Lexicographic)?;
//! txn.commit()?;
//!
//! let read = tree.begin_read()?;
//! let mut cursor = read.scan()?;
//! while cursor.valid() {
//!     println!("{:?} = {:?}", cursor.key()?, cursor.value()?);
//!     cursor.advance()?;
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   BpTree / BpTxn / BpTreeCursor      │  versions, put / get / remove
//! ├──────────────────────────────────────┤
//! │   Node codec  │  Overflow region     │  <path>.ovf for large values
//! ├──────────────────────────────────────┤
//! │   Storage: page cache + write batch  │  LRU, hash chains, pinning
//! ├──────────────────────────────────────┤
//! │   IoQueue + PageFile                 │  worker pool, pread / pwrite
//! └──────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data.cow
//! ├── sector 0             super-block, two checksummed commit slots
//! ├── sectors 1..=B        free-space bitmap
//! └── remaining sectors    B+tree nodes
//! data.cow.ovf             overflow values, byte-addressed
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: page geometry and limits
//! - [`storage`]: page file, cache, asynchronous I/O, bitmap, super-block
//! - [`btree`]: node format, transactions, cursors, overflow values

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod storage;

pub use btree::{
    BpTree, BpTreeCursor, BpTreeSearch, BpTxn, Lexicographic, TreeBuilder, TreeStats, TxnMode,
    TxnState,
};
pub use storage::{CacheStats, Storage, StorageConfig};
