//! # Copy-on-Write B+Tree
//!
//! This module implements the B+tree itself on top of [`crate::storage`].
//! Committed pages are never modified: a write transaction copies every page
//! on its descent path before touching it and publishes the new root through
//! the super-block in one atomic step.
//!
//! ## Node Layout
//!
//! Every node is one `NODE_SIZE` page: a 32-byte header, a directory of
//! 2-byte slots growing up from the header and entries packed down from the
//! end of the page. Internal and leaf nodes share the layout and differ only
//! in the entry kind they hold (see [`node`](self::NodeView)).
//!
//! ```text
//! internal:  [ ""  -> c0 | k1 -> c1 | k2 -> c2 | ... ]
//!              c_i holds keys in [k_i, k_{i+1})
//!
//! leaf:      [ k0 = v0 | k1 = v1 | k2 -> ovf(start..end) | ... ]
//! ```
//!
//! Keys are opaque bytes ordered by a caller-supplied [`BpTreeSearch`].
//! Duplicate keys are allowed. Values longer than `MAX_INLINE_VALUE` are
//! stored in the [`OverflowRegion`] sidecar file.
//!
//! ## Versions
//!
//! ```text
//!  sequence 7          sequence 8 (after put)
//!     R7                    R8
//!    /  \                  /  \
//!   A    B   <── shared ──A    B'
//!                               \
//!                                leaf'
//! ```
//!
//! Readers pin the `(root, sequence)` pair they started with. Pages replaced
//! by a commit are released only when every reader of an older sequence has
//! finished.
//!
//! ## Module Organization
//!
//! - `node`: entry codec, `NodeView` / `NodeViewMut`, `move_entries`
//! - `search`: `BpTreeSearch` comparators and descent breadcrumbs
//! - `overflow`: sidecar file for large values
//! - `tree`: `BpTree`, open / create / recovery, snapshot tracking
//! - `txn`: `BpTxn`, put / get / remove, split and underflow handling
//! - `cursor`: ordered iteration within a transaction
//!
//! ## Usage
//!
//! ```ignore
//! use cowtree::btree::{BpTree, Lexicographic};
//!
//! let tree = BpTree::builder().path("./data.cow").total_pages(4096).open()?;
//!
//! let mut txn = tree.begin_write()?;
//! txn.put(b"alpha", b"1", &Lexicographic)?;
//! txn.commit()?;
//!
//! let read = tree.begin_read()?;
//! assert_eq!(read.get(b"alpha", &Lexicographic)?, Some(b"1".to_vec()));
//! ```

mod cursor;
mod node;
mod overflow;
mod search;
mod tree;
mod txn;

pub use cursor::BpTreeCursor;
pub use node::{
    entry_size, move_entries, BpTreeItem, BpTreeItemType, InsertOutcome, NodeHeader, NodeView,
    NodeViewMut, OverflowRef,
};
pub use overflow::{OverflowRange, OverflowRegion};
pub use search::{BpTreeSearch, BpTreeSearchResult, Lexicographic, PathStep};
pub use tree::{BpTree, TreeBuilder, TreeStats};
pub use txn::{BpTxn, PageRef, TxnMode, TxnState};
