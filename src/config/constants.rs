//! # cowtree Configuration Constants
//!
//! This module centralizes the configuration constants of the storage engine
//! and the B+tree. Constants that depend on each other are co-located and the
//! relationships are checked with compile-time assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! OS_PAGE_SIZE (4096 bytes)
//!       │
//!       └─> NODE_SIZE (16384 = 4 × OS_PAGE_SIZE, must be a multiple)
//!             │   The unit of I/O, caching and allocation. Buffers are
//!             │   aligned to OS_PAGE_SIZE so they are valid for O_DIRECT.
//!             │
//!             ├─> NODE_HEADER_SIZE (32 bytes, fixed)
//!             │
//!             ├─> LEAF_ARRAY_SIZE / INTERNAL_ARRAY_SIZE
//!             │     (derived: NODE_SIZE - NODE_HEADER_SIZE, shared by the
//!             │      offset directory and the entry area)
//!             │
//!             ├─> MAX_LEAF_ENTRIES / MAX_INTERNAL_ENTRIES
//!             │     (derived: NODE_SIZE / MIN_ENTRY_SIZE)
//!             │
//!             ├─> MAX_KEY_LEN + MAX_INLINE_VALUE
//!             │     A half-full node plus one maximal entry must still fit
//!             │     in a node, otherwise a split cannot make room.
//!             │
//!             └─> MIN_FILL_BYTES (merge / borrow threshold on delete)
//!
//! DEFAULT_CACHE_CAPACITY (pages)
//!       │
//!       └─> hash buckets = 2 × capacity (built at Storage::open)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{NODE_SIZE, MAX_LEVELS};
//! ```

// ============================================================================
// PAGE LAYOUT CONSTANTS
// ============================================================================

/// Operating system page size. Page buffers are aligned to this boundary.
pub const OS_PAGE_SIZE: usize = 4096;

/// Size of every on-disk page (super-block, bitmap and tree nodes).
pub const NODE_SIZE: usize = 4 * OS_PAGE_SIZE;

/// Fixed header at the start of every tree node.
pub const NODE_HEADER_SIZE: usize = 32;

/// Bytes available to the offset directory plus the entry area of a leaf.
pub const LEAF_ARRAY_SIZE: usize = NODE_SIZE - NODE_HEADER_SIZE;

/// Bytes available to the offset directory plus the entry area of an
/// internal node.
pub const INTERNAL_ARRAY_SIZE: usize = NODE_SIZE - NODE_HEADER_SIZE;

/// Width of one offset directory slot.
pub const DIRECTORY_SLOT_SIZE: usize = 2;

/// Smallest entry accounted for when deriving the entry count caps.
pub const MIN_ENTRY_SIZE: usize = 32;

pub const MAX_LEAF_ENTRIES: usize = NODE_SIZE / MIN_ENTRY_SIZE;

pub const MAX_INTERNAL_ENTRIES: usize = NODE_SIZE / MIN_ENTRY_SIZE;

/// Longest key accepted by the tree.
pub const MAX_KEY_LEN: usize = 1024;

/// Values longer than this are moved to the overflow region.
pub const MAX_INLINE_VALUE: usize = NODE_SIZE / 16;

/// Largest serialized entry (a leaf entry with a maximal key and inline value).
pub const MAX_ENTRY_SIZE: usize = 7 + MAX_KEY_LEN + MAX_INLINE_VALUE;

/// A non-root node whose entry area drops below this is merged or refilled.
pub const MIN_FILL_BYTES: usize = LEAF_ARRAY_SIZE / 4;

const _: () = assert!(
    NODE_SIZE % OS_PAGE_SIZE == 0,
    "NODE_SIZE must be a multiple of the OS page size"
);

const _: () = assert!(
    NODE_SIZE <= u16::MAX as usize,
    "node offsets are stored as u16"
);

const _: () = assert!(
    LEAF_ARRAY_SIZE / 2 + 2 * (MAX_ENTRY_SIZE + DIRECTORY_SLOT_SIZE) <= LEAF_ARRAY_SIZE,
    "a split half plus one maximal entry must fit in a node"
);

const _: () = assert!(
    MAX_LEAF_ENTRIES * DIRECTORY_SLOT_SIZE < LEAF_ARRAY_SIZE,
    "directory for MAX_LEAF_ENTRIES must fit in a node"
);

// ============================================================================
// TREE CONSTANTS
// ============================================================================

/// Deepest tree a search may descend through (breadcrumb trail capacity).
pub const MAX_LEVELS: usize = 128;

/// Breadcrumb entries kept inline before spilling to the heap.
pub const INLINE_LEVELS: usize = 8;

// ============================================================================
// FILE LAYOUT CONSTANTS
// ============================================================================

/// Page id of the super-block.
pub const SUPERBLOCK_PAGE: u64 = 0;

/// Size of one commit slot inside the super-block page.
pub const SUPERBLOCK_SLOT_SIZE: usize = 128;

/// Number of commit slots (dual-slot commit).
pub const SUPERBLOCK_SLOTS: usize = 2;

/// Default size of a newly created tree file, in pages.
pub const DEFAULT_TOTAL_PAGES: u64 = 1024;

/// Suffix appended to the tree path to name the overflow region file.
pub const OVERFLOW_SUFFIX: &str = "ovf";

const _: () = assert!(
    SUPERBLOCK_SLOT_SIZE * SUPERBLOCK_SLOTS <= NODE_SIZE,
    "both commit slots must fit in page 0"
);

// ============================================================================
// PAGE CACHE / I/O CONFIGURATION
// ============================================================================

/// Default number of page buffers in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Default number of concurrent I/O workers.
pub const DEFAULT_IO_QUEUE_DEPTH: usize = 4;

/// Multiplicative hash constant used to spread sectors over hash buckets.
pub const HASH_CONSTANT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Sector value of a cache entry that holds no page.
pub const EMPTY_SECTOR: u64 = u64::MAX;

/// Chain / LRU link value meaning "no entry".
pub const NIL: u32 = u32::MAX;

const _: () = assert!(DEFAULT_CACHE_CAPACITY > 0, "cache needs at least one slot");
const _: () = assert!(DEFAULT_IO_QUEUE_DEPTH > 0, "I/O queue needs at least one worker");
