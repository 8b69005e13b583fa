//! # Transactions
//!
//! A `BpTxn` is a versioned view of a [`BpTree`]: the `(root, sequence)` pair
//! committed when it started, plus, for a write transaction, a working set of
//! shadow pages that nobody else can see.
//!
//! ## States
//!
//! ```text
//!            commit()
//!   Active ────────────> Committed
//!     │  │
//!     │  └─────────────> Aborted      abort(), drop, or failed commit
//!     │                     ^
//!     └──> Failed ──────────┘         abort() or drop
//! ```
//!
//! `commit` and `abort` consume the transaction, so a finished transaction
//! cannot be used again. A `put` or `remove` that errors after it started
//! changing pages leaves the transaction `Failed`: every later call is
//! rejected and the only way out is to abort.
//!
//! Before changing anything, a write reserves the pages it can need in the
//! worst case (a copy of each committed page on its path, one split per
//! level and a new root). Running out of pages therefore fails the write
//! up front and leaves the transaction usable.
//!
//! ## Working Set
//!
//! Every page id the transaction reaches is either [`PageRef::Committed`]
//! (read through the page cache, never written) or [`PageRef::Shadow`] (a
//! private copy allocated by this transaction, held in memory until commit).
//! Before a committed page is modified it is copied to a new page id and
//! the parent's child pointer is redirected, top-down along the descent
//! path. The copied page id is retired: it is released to the bitmap only
//! after the commit, once no older snapshot can reach it.
//!
//! ## Descent
//!
//! Internal entry 0 acts as negative infinity. Two biases are used:
//!
//! ```text
//! lower (get, remove):  child = #{ i >= 1 : key_i <  k },  leaf lower bound
//! upper (put):          child = #{ i >= 1 : key_i <= k },  leaf upper bound
//! ```
//!
//! With duplicates, `put` lands after every existing equal key and `get`
//! lands on the first one. A lower-bias position past the end of its leaf is
//! moved to the next leaf through the breadcrumbs.
//!
//! ## Split
//!
//! A node that rejects an insert is split at the byte midpoint of its
//! entries. The upper half moves to a new node, the entry goes to whichever
//! half owns its position, and the first key of the new node is inserted
//! into the parent right after the split node's slot. A split root grows the
//! tree by one level.
//!
//! ## Underflow
//!
//! After a remove, a node whose entries occupy less than `MIN_FILL_BYTES` is
//! merged with a sibling (right sibling preferred) when both fit in one
//! node, otherwise entries are borrowed one at a time from the sibling. When
//! neither is possible the node stays underfull. An internal root left with
//! a single child is replaced by that child.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::MutexGuard;
use tracing::{debug, trace, warn};

use super::cursor::BpTreeCursor;
use super::node::{move_entries, BpTreeItem, InsertOutcome, NodeView, NodeViewMut};
use super::overflow::OverflowRange;
use super::search::{BpTreeSearch, BpTreeSearchResult};
use super::tree::BpTree;
use crate::config::{
    DIRECTORY_SLOT_SIZE, MAX_INLINE_VALUE, MAX_KEY_LEN, MAX_LEAF_ENTRIES, MIN_FILL_BYTES,
    NODE_SIZE,
};
use crate::storage::PageBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// Where a page id lives from the point of view of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRef {
    Shadow(u64),
    Committed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Bias {
    Lower,
    Upper,
}

/// A page borrowed from the working set or the page cache.
pub(crate) enum PageRead<'a> {
    Shadow(&'a PageBuf),
    Committed(Arc<PageBuf>),
}

impl Deref for PageRead<'_> {
    type Target = PageBuf;

    fn deref(&self) -> &PageBuf {
        match self {
            PageRead::Shadow(buf) => *buf,
            PageRead::Committed(buf) => &**buf,
        }
    }
}

pub struct BpTxn<'t> {
    tree: &'t BpTree,
    mode: TxnMode,
    state: TxnState,
    snapshot_root: u64,
    sequence: u64,
    root: u64,
    shadows: HashMap<u64, Box<PageBuf>>,
    retired_pages: Vec<u64>,
    overflow_pending: BTreeMap<u64, (OverflowRange, Vec<u8>)>,
    retired_overflow: Vec<OverflowRange>,
    reserved: Vec<u64>,
    _writer: Option<MutexGuard<'t, ()>>,
}

impl<'t> BpTxn<'t> {
    pub(crate) fn new(
        tree: &'t BpTree,
        mode: TxnMode,
        root: u64,
        sequence: u64,
        writer: Option<MutexGuard<'t, ()>>,
    ) -> Self {
        Self {
            tree,
            mode,
            state: TxnState::Active,
            snapshot_root: root,
            sequence,
            root,
            shadows: HashMap::new(),
            retired_pages: Vec::new(),
            overflow_pending: BTreeMap::new(),
            retired_overflow: Vec::new(),
            reserved: Vec::new(),
            _writer: writer,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Sequence number of the snapshot this transaction started from.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current root, a shadow page once the transaction has written.
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn page_ref(&self, page_id: u64) -> PageRef {
        if self.shadows.contains_key(&page_id) {
            PageRef::Shadow(page_id)
        } else {
            PageRef::Committed(page_id)
        }
    }

    /// Number of pages allocated by this transaction.
    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    fn ensure_active(&self) -> Result<()> {
        ensure!(
            self.state == TxnState::Active,
            "transaction is not active ({:?})",
            self.state
        );
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        ensure!(
            self.mode == TxnMode::ReadWrite,
            "transaction is read-only"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    pub(crate) fn page(&self, page_id: u64) -> Result<PageRead<'_>> {
        if let Some(buf) = self.shadows.get(&page_id) {
            return Ok(PageRead::Shadow(&**buf));
        }
        let buf = self
            .tree
            .storage()
            .load(page_id)
            .wrap_err_with(|| format!("failed to load page {}", page_id))?;
        Ok(PageRead::Committed(buf))
    }

    fn shadow(&self, page_id: u64) -> Result<NodeView<'_>> {
        let buf = self
            .shadows
            .get(&page_id)
            .ok_or_else(|| eyre!("page {} is not a shadow of this transaction", page_id))?;
        NodeView::from_page(buf.as_slice())
    }

    fn shadow_mut(&mut self, page_id: u64) -> Result<NodeViewMut<'_>> {
        let buf = self
            .shadows
            .get_mut(&page_id)
            .ok_or_else(|| eyre!("page {} is not a shadow of this transaction", page_id))?;
        NodeViewMut::from_page(buf.as_mut_slice())
    }

    fn take_shadow(&mut self, page_id: u64) -> Result<Box<PageBuf>> {
        self.shadows
            .remove(&page_id)
            .ok_or_else(|| eyre!("page {} is not a shadow of this transaction", page_id))
    }

    fn scratch_copy(&self, page_id: u64) -> Result<Box<PageBuf>> {
        let mut copy = PageBuf::boxed();
        copy.copy_from_page(self.page(page_id)?.as_slice())?;
        Ok(copy)
    }

    pub(crate) fn prefetch(&self, page_id: u64) -> Result<()> {
        if self.shadows.contains_key(&page_id) {
            return Ok(());
        }
        self.tree.storage().prefetch(page_id)
    }

    fn alloc_page(&mut self) -> Result<u64> {
        if let Some(page_id) = self.reserved.pop() {
            return Ok(page_id);
        }
        let bitmap = self.tree.bitmap();
        bitmap
            .find_free_bit()
            .ok_or_else(|| eyre!("page bitmap exhausted: all {} pages in use", bitmap.bits()))
    }

    /// Reserves a copy of every committed page on `path` plus `extra` pages.
    /// Nothing stays reserved when the bitmap cannot supply them all.
    fn reserve_pages(&mut self, path: &BpTreeSearchResult, extra: usize) -> Result<()> {
        let copies = path
            .steps()
            .iter()
            .filter(|step| !self.shadows.contains_key(&step.node_id))
            .count();
        let needed = copies + extra;

        let bitmap = self.tree.bitmap();
        while self.reserved.len() < needed {
            match bitmap.find_free_bit() {
                Some(page_id) => self.reserved.push(page_id),
                None => {
                    let free = self.reserved.len();
                    self.release_reserved();
                    bail!(
                        "page bitmap exhausted: write needs {} pages, {} free",
                        needed,
                        free
                    );
                }
            }
        }
        Ok(())
    }

    fn release_reserved(&mut self) {
        let bitmap = self.tree.bitmap();
        for page_id in self.reserved.drain(..) {
            bitmap.release_bit(page_id);
        }
    }

    /// Fails the transaction when a write that already changed pages errors.
    fn check_write<T>(&mut self, result: Result<T>) -> Result<T> {
        self.release_reserved();
        if let Err(e) = &result {
            warn!(sequence = self.sequence, error = %e, "write failed midway, transaction must be aborted");
            self.state = TxnState::Failed;
        }
        result
    }

    fn new_node(&mut self, is_internal: bool, parent: u64) -> Result<u64> {
        let page_id = self.alloc_page()?;
        let mut buf = PageBuf::boxed();
        {
            let mut node = NodeViewMut::init(buf.as_mut_slice(), parent, is_internal)?;
            node.set_is_copy(true);
        }
        self.shadows.insert(page_id, buf);
        Ok(page_id)
    }

    /// Returns a shadow for `page_id`, copying it if it is committed.
    fn cow(&mut self, page_id: u64, parent: u64) -> Result<u64> {
        if self.shadows.contains_key(&page_id) {
            return Ok(page_id);
        }

        let mut buf = PageBuf::boxed();
        {
            let committed = self
                .tree
                .storage()
                .load(page_id)
                .wrap_err_with(|| format!("failed to load page {}", page_id))?;
            buf.copy_from_page(committed.as_slice())?;
        }
        {
            let mut node = NodeViewMut::from_page(buf.as_mut_slice())?;
            node.set_is_copy(true);
            node.set_parent(parent);
        }

        let shadow = self.alloc_page()?;
        self.shadows.insert(shadow, buf);
        self.retired_pages.push(page_id);
        trace!(page_id, shadow, "page copied");
        Ok(shadow)
    }

    /// Copies child `slot` of shadow `parent` and redirects the pointer.
    fn cow_child(&mut self, parent: u64, slot: usize) -> Result<u64> {
        let child = self.shadow(parent)?.node_id(slot)?;
        let shadow = self.cow(child, parent)?;
        if shadow != child {
            self.shadow_mut(parent)?.set_node_id(slot, shadow)?;
        }
        Ok(shadow)
    }

    /// Replaces every page on `path` with a shadow, root first.
    fn cow_path(&mut self, path: &mut BpTreeSearchResult) -> Result<()> {
        let first = path
            .get(0)
            .ok_or_else(|| eyre!("empty descent path"))?;
        let root = self.cow(first.node_id, 0)?;
        self.root = root;
        path.set_node_id(0, root);

        for level in 1..path.depth() {
            let parent = path
                .get(level - 1)
                .ok_or_else(|| eyre!("descent path shorter than {}", level))?;
            let shadow = self.cow_child(parent.node_id, parent.key_index)?;
            path.set_node_id(level, shadow);
        }
        Ok(())
    }

    fn free_page(&mut self, page_id: u64) {
        if self.shadows.remove(&page_id).is_some() {
            self.tree.bitmap().release_bit(page_id);
        } else {
            self.retired_pages.push(page_id);
        }
    }

    fn stage_overflow(&mut self, value: &[u8]) -> Result<OverflowRange> {
        let range = self.tree.overflow().allocate(value.len() as u64)?;
        self.overflow_pending
            .insert(range.start, (range, value.to_vec()));
        Ok(range)
    }

    fn free_overflow(&mut self, range: OverflowRange) {
        if self.overflow_pending.remove(&range.start).is_some() {
            self.tree.overflow().release(range);
        } else {
            self.retired_overflow.push(range);
        }
    }

    // ------------------------------------------------------------------
    // Navigation
    // ------------------------------------------------------------------

    pub(crate) fn locate<S>(&self, key: &[u8], search: &S, bias: Bias) -> Result<BpTreeSearchResult>
    where
        S: BpTreeSearch + ?Sized,
    {
        let mut path = BpTreeSearchResult::new();
        let mut page_id = self.root;

        loop {
            let page = self.page(page_id)?;
            let node = NodeView::from_page(page.as_slice())
                .wrap_err_with(|| format!("corrupt node at page {}", page_id))?;
            let cmp = |entry: &[u8]| search.compare(entry, key);

            if node.is_leaf() {
                let index = match bias {
                    Bias::Lower => node.lower_bound(0, cmp)?,
                    Bias::Upper => node.upper_bound(0, cmp)?,
                };
                path.push(page_id, index)?;
                return Ok(path);
            }

            ensure!(
                node.num_entries() > 0,
                "internal node {} has no entries",
                page_id
            );
            let bound = match bias {
                Bias::Lower => node.lower_bound(1, cmp)?,
                Bias::Upper => node.upper_bound(1, cmp)?,
            };
            let slot = bound - 1;
            path.push(page_id, slot)?;
            page_id = node.node_id(slot)?;
        }
    }

    /// Appends the leftmost descent from `page_id` to `path`.
    pub(crate) fn descend_leftmost(&self, mut page_id: u64, path: &mut BpTreeSearchResult) -> Result<()> {
        loop {
            let page = self.page(page_id)?;
            let node = NodeView::from_page(page.as_slice())
                .wrap_err_with(|| format!("corrupt node at page {}", page_id))?;
            path.push(page_id, 0)?;
            if node.is_leaf() {
                return Ok(());
            }
            page_id = node.node_id(0)?;
        }
    }

    /// Moves `path` to the first entry of the next leaf. Returns false at
    /// the end of the tree.
    pub(crate) fn next_leaf(&self, path: &mut BpTreeSearchResult) -> Result<bool> {
        let mut level = path.depth().saturating_sub(1);

        while level > 0 {
            level -= 1;
            let step = path
                .get(level)
                .ok_or_else(|| eyre!("descent path shorter than {}", level))?;
            let (next_child, after) = {
                let page = self.page(step.node_id)?;
                let node = NodeView::from_page(page.as_slice())?;
                let n = node.num_entries();
                if step.key_index + 1 >= n {
                    continue;
                }
                let after = if step.key_index + 2 < n {
                    Some(node.node_id(step.key_index + 2)?)
                } else {
                    None
                };
                (node.node_id(step.key_index + 1)?, after)
            };

            if let Some(sibling) = after {
                self.prefetch(sibling)?;
            }
            path.set_key_index(level, step.key_index + 1);
            path.truncate(level + 1);
            self.descend_leftmost(next_child, path)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Moves a leaf position past the end of its leaf forward to the next
    /// entry. Returns false when no entry remains.
    pub(crate) fn settle(&self, path: &mut BpTreeSearchResult) -> Result<bool> {
        loop {
            let step = path
                .leaf()
                .ok_or_else(|| eyre!("empty descent path"))?;
            let n = {
                let page = self.page(step.node_id)?;
                NodeView::from_page(page.as_slice())?.num_entries()
            };
            if step.key_index < n {
                return Ok(true);
            }
            if !self.next_leaf(path)? {
                return Ok(false);
            }
        }
    }

    fn read_overflow(&self, range: OverflowRange, value_len: u32) -> Result<Vec<u8>> {
        ensure!(
            range.len() == value_len as u64,
            "overflow range {}..{} does not hold {} bytes",
            range.start,
            range.end,
            value_len
        );
        if let Some((_, data)) = self.overflow_pending.get(&range.start) {
            return Ok(data.clone());
        }
        self.tree.overflow().read(range)
    }

    /// Value of leaf entry `index`, resolving overflow entries.
    pub(crate) fn read_value(&self, node: &NodeView<'_>, index: usize) -> Result<Vec<u8>> {
        match node.item(index)? {
            BpTreeItem::Leaf { value, .. } => Ok(value.to_vec()),
            BpTreeItem::Overflow {
                value_len,
                start,
                end,
                ..
            } => self.read_overflow(OverflowRange::new(start, end), value_len),
            BpTreeItem::Internal { .. } => bail!("entry {} is not a leaf entry", index),
        }
    }

    fn value_matches(&self, node: &NodeView<'_>, index: usize, expected: &[u8]) -> Result<bool> {
        if node.value_len(index)? != expected.len() {
            return Ok(false);
        }
        Ok(self.read_value(node, index)? == expected)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Value of the first entry equal to `key`.
    pub fn get<S>(&self, key: &[u8], search: &S) -> Result<Option<Vec<u8>>>
    where
        S: BpTreeSearch + ?Sized,
    {
        self.ensure_active()?;
        let mut path = self.locate(key, search, Bias::Lower)?;
        if !self.settle(&mut path)? {
            return Ok(None);
        }

        let step = path
            .leaf()
            .ok_or_else(|| eyre!("empty descent path"))?;
        let page = self.page(step.node_id)?;
        let node = NodeView::from_page(page.as_slice())?;
        if search.compare(node.key(step.key_index)?, key) != Ordering::Equal {
            return Ok(None);
        }
        self.read_value(&node, step.key_index).map(Some)
    }

    /// Values of every entry equal to `key`, in insertion order.
    pub fn get_all<S>(&self, key: &[u8], search: &S) -> Result<Vec<Vec<u8>>>
    where
        S: BpTreeSearch + ?Sized,
    {
        self.ensure_active()?;
        let mut values = Vec::new();
        let mut cursor = self.seek(key, search)?;
        while cursor.valid() {
            if search.compare(cursor.key()?, key) != Ordering::Equal {
                break;
            }
            values.push(cursor.value()?);
            cursor.advance()?;
        }
        Ok(values)
    }

    /// Cursor over every entry in key order.
    pub fn scan(&self) -> Result<BpTreeCursor<'_, 't>> {
        self.ensure_active()?;
        let mut path = BpTreeSearchResult::new();
        self.descend_leftmost(self.root, &mut path)?;
        BpTreeCursor::new(self, path)
    }

    /// Cursor positioned at the first entry not less than `key`.
    pub fn seek<S>(&self, key: &[u8], search: &S) -> Result<BpTreeCursor<'_, 't>>
    where
        S: BpTreeSearch + ?Sized,
    {
        self.ensure_active()?;
        let path = self.locate(key, search, Bias::Lower)?;
        BpTreeCursor::new(self, path)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Inserts `key` with `value`. Existing equal keys are kept; the new
    /// entry is placed after them.
    pub fn put<S>(&mut self, key: &[u8], value: &[u8], search: &S) -> Result<()>
    where
        S: BpTreeSearch + ?Sized,
    {
        self.ensure_writable()?;
        ensure!(
            key.len() <= MAX_KEY_LEN,
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_LEN
        );
        ensure!(
            value.len() <= u32::MAX as usize,
            "value length {} exceeds maximum {}",
            value.len(),
            u32::MAX
        );

        let mut path = self.locate(key, search, Bias::Upper)?;
        self.reserve_pages(&path, path.depth() + 1)?;

        let item = if value.len() > MAX_INLINE_VALUE {
            let range = match self.stage_overflow(value) {
                Ok(range) => range,
                Err(e) => {
                    self.release_reserved();
                    return Err(e);
                }
            };
            BpTreeItem::Overflow {
                key,
                value_len: value.len() as u32,
                start: range.start,
                end: range.end,
            }
        } else {
            BpTreeItem::Leaf { key, value }
        };

        let result = self.insert_along(&mut path, &item);
        self.check_write(result)
    }

    /// Inserts `item` at the leaf position of `path`, splitting upwards.
    fn insert_along(&mut self, path: &mut BpTreeSearchResult, item: &BpTreeItem<'_>) -> Result<()> {
        self.cow_path(path)?;

        let leaf = path
            .leaf()
            .ok_or_else(|| eyre!("empty descent path"))?;
        let mut pending = self.insert_or_split(leaf.node_id, leaf.key_index, item)?;
        let mut level = path.depth() - 1;

        while let Some((separator, right)) = pending {
            if level == 0 {
                self.grow_root(&separator, right)?;
                break;
            }
            level -= 1;
            let step = path
                .get(level)
                .ok_or_else(|| eyre!("descent path shorter than {}", level))?;
            let entry = BpTreeItem::Internal {
                key: &separator,
                child: right,
            };
            pending = self.insert_or_split(step.node_id, step.key_index + 1, &entry)?;
        }

        Ok(())
    }

    /// Inserts into a shadow node, splitting it when full. Returns the
    /// separator and page id of the new right node after a split.
    fn insert_or_split(
        &mut self,
        page_id: u64,
        index: usize,
        item: &BpTreeItem<'_>,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        if self.shadow_mut(page_id)?.insert_entry(index, item)? == InsertOutcome::Inserted {
            return Ok(None);
        }

        let (is_internal, parent) = {
            let node = self.shadow(page_id)?;
            (node.is_internal(), node.parent())
        };
        let right_id = self.new_node(is_internal, parent)?;

        let mut left = self.take_shadow(page_id)?;
        let mut right = match self.take_shadow(right_id) {
            Ok(buf) => buf,
            Err(e) => {
                self.shadows.insert(page_id, left);
                return Err(e);
            }
        };
        let result = split_into(&mut left, &mut right, right_id, index, item);
        self.shadows.insert(page_id, left);
        self.shadows.insert(right_id, right);

        let separator = result?;
        trace!(page_id, right = right_id, "node split");
        Ok(Some((separator, right_id)))
    }

    fn grow_root(&mut self, separator: &[u8], right: u64) -> Result<()> {
        let left = self.root;
        let root = self.new_node(true, 0)?;
        {
            let mut node = self.shadow_mut(root)?;
            let first = node.insert_entry(0, &BpTreeItem::Internal { key: b"", child: left })?;
            let second = node.insert_entry(
                1,
                &BpTreeItem::Internal {
                    key: separator,
                    child: right,
                },
            )?;
            ensure!(
                first == InsertOutcome::Inserted && second == InsertOutcome::Inserted,
                "new root {} has no room for two entries",
                root
            );
        }
        self.shadow_mut(left)?.set_parent(root);
        self.shadow_mut(right)?.set_parent(root);
        self.root = root;
        debug!(root, left, right, "tree grew a level");
        Ok(())
    }

    /// Removes the first entry equal to `key` (and holding `value`, when
    /// given). Returns whether an entry was removed.
    pub fn remove<S>(&mut self, key: &[u8], value: Option<&[u8]>, search: &S) -> Result<bool>
    where
        S: BpTreeSearch + ?Sized,
    {
        self.ensure_writable()?;
        let mut path = self.locate(key, search, Bias::Lower)?;

        loop {
            if !self.settle(&mut path)? {
                return Ok(false);
            }
            let step = path
                .leaf()
                .ok_or_else(|| eyre!("empty descent path"))?;
            let (key_equal, value_equal) = {
                let page = self.page(step.node_id)?;
                let node = NodeView::from_page(page.as_slice())?;
                if search.compare(node.key(step.key_index)?, key) != Ordering::Equal {
                    (false, false)
                } else {
                    match value {
                        None => (true, true),
                        Some(expected) => (
                            true,
                            self.value_matches(&node, step.key_index, expected)?,
                        ),
                    }
                }
            };

            if !key_equal {
                return Ok(false);
            }
            if value_equal {
                break;
            }
            path.set_key_index(path.depth() - 1, step.key_index + 1);
        }

        self.reserve_pages(&path, path.depth())?;
        let result = self.remove_at(&mut path);
        self.check_write(result).map(|()| true)
    }

    /// Deletes the leaf entry `path` points at and rebalances upwards.
    fn remove_at(&mut self, path: &mut BpTreeSearchResult) -> Result<()> {
        self.cow_path(path)?;
        let step = path
            .leaf()
            .ok_or_else(|| eyre!("empty descent path"))?;

        let overflow = match self.shadow(step.node_id)?.item(step.key_index)? {
            BpTreeItem::Overflow { start, end, .. } => Some(OverflowRange::new(start, end)),
            _ => None,
        };
        self.shadow_mut(step.node_id)?.delete_entry(step.key_index)?;
        if let Some(range) = overflow {
            self.free_overflow(range);
        }

        self.rebalance(path)
    }

    fn rebalance(&mut self, path: &BpTreeSearchResult) -> Result<()> {
        let mut level = path.depth() - 1;

        loop {
            if level == 0 {
                return self.collapse_root();
            }

            let node_id = path
                .get(level)
                .ok_or_else(|| eyre!("descent path shorter than {}", level))?
                .node_id;
            if !self.is_underfull(node_id)? {
                return Ok(());
            }

            let parent = path
                .get(level - 1)
                .ok_or_else(|| eyre!("descent path shorter than {}", level))?;
            let siblings = self.shadow(parent.node_id)?.num_entries();
            if siblings < 2 {
                return Ok(());
            }

            let (left_slot, node_is_left) = if parent.key_index + 1 < siblings {
                (parent.key_index, true)
            } else {
                (parent.key_index - 1, false)
            };

            let left_id = self.cow_child(parent.node_id, left_slot)?;
            if self.try_merge(parent.node_id, left_slot, left_id)? {
                level -= 1;
                continue;
            }

            let right_id = self.cow_child(parent.node_id, left_slot + 1)?;
            self.redistribute(parent.node_id, left_slot, left_id, right_id, node_is_left)?;
            return Ok(());
        }
    }

    fn is_underfull(&self, page_id: u64) -> Result<bool> {
        let node = self.shadow(page_id)?;
        Ok(node.used_bytes() + node.num_entries() * DIRECTORY_SLOT_SIZE < MIN_FILL_BYTES)
    }

    /// Merges child `left_slot + 1` of `parent` into shadow `left_id`.
    fn try_merge(&mut self, parent: u64, left_slot: usize, left_id: u64) -> Result<bool> {
        let (separator, right_id) = {
            let node = self.shadow(parent)?;
            (node.key(left_slot + 1)?.to_vec(), node.node_id(left_slot + 1)?)
        };

        let mut right = self.scratch_copy(right_id)?;
        let mut left = self.take_shadow(left_id)?;
        let merged = merge_into(&mut left, &mut right, &separator);
        self.shadows.insert(left_id, left);
        if !merged? {
            return Ok(false);
        }

        self.shadow_mut(parent)?.delete_entry(left_slot + 1)?;
        self.free_page(right_id);
        trace!(left = left_id, right = right_id, "nodes merged");
        Ok(true)
    }

    fn redistribute(
        &mut self,
        parent: u64,
        left_slot: usize,
        left_id: u64,
        right_id: u64,
        node_is_left: bool,
    ) -> Result<()> {
        let (node_id, sibling_id) = if node_is_left {
            (left_id, right_id)
        } else {
            (right_id, left_id)
        };

        for _ in 0..MAX_LEAF_ENTRIES {
            if !self.is_underfull(node_id)? {
                break;
            }
            let (sibling_bytes, sibling_entries, moving) = {
                let sibling = self.shadow(sibling_id)?;
                let n = sibling.num_entries();
                if n < 2 {
                    break;
                }
                let moving = if node_is_left {
                    sibling.entry_size(0)?
                } else {
                    sibling.entry_size(n - 1)?
                };
                (
                    sibling.used_bytes() + n * DIRECTORY_SLOT_SIZE,
                    n,
                    moving + DIRECTORY_SLOT_SIZE,
                )
            };
            if sibling_entries < 2 || sibling_bytes - moving < MIN_FILL_BYTES {
                break;
            }

            let mut left = self.scratch_copy(left_id)?;
            let mut right = self.scratch_copy(right_id)?;
            let mut parent_page = self.scratch_copy(parent)?;
            if !shift_one(
                &mut left,
                &mut right,
                &mut parent_page,
                left_slot,
                right_id,
                node_is_left,
            )? {
                break;
            }
            self.shadows.insert(left_id, left);
            self.shadows.insert(right_id, right);
            self.shadows.insert(parent, parent_page);
        }
        Ok(())
    }

    fn collapse_root(&mut self) -> Result<()> {
        loop {
            let only_child = {
                let page = self.page(self.root)?;
                let node = NodeView::from_page(page.as_slice())?;
                if !node.is_internal() || node.num_entries() != 1 {
                    return Ok(());
                }
                node.node_id(0)?
            };
            let old = self.root;
            self.root = only_child;
            self.free_page(old);
            debug!(root = only_child, "tree lost a level");
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn has_changes(&self) -> bool {
        self.root != self.snapshot_root
            || !self.shadows.is_empty()
            || !self.retired_pages.is_empty()
            || !self.overflow_pending.is_empty()
            || !self.retired_overflow.is_empty()
    }

    /// Makes this transaction's writes durable and visible. Returns the new
    /// sequence number, or the snapshot's for a transaction without writes.
    pub fn commit(mut self) -> Result<u64> {
        self.ensure_active()?;

        if self.mode == TxnMode::ReadOnly || !self.has_changes() {
            self.state = TxnState::Committed;
            return Ok(self.sequence);
        }

        match self.write_commit() {
            Ok(sequence) => {
                self.state = TxnState::Committed;
                let pages = std::mem::take(&mut self.retired_pages);
                let overflow = std::mem::take(&mut self.retired_overflow);
                debug!(
                    sequence,
                    root = self.root,
                    pages = self.shadows.len(),
                    retired = pages.len(),
                    "transaction committed"
                );
                self.shadows.clear();
                self.overflow_pending.clear();
                self.tree.retire(sequence, pages, overflow);
                Ok(sequence)
            }
            Err(e) if self.tree.is_poisoned() => {
                // The new super-block slot may be on disk and point at these pages.
                warn!(
                    sequence = self.sequence,
                    pages = self.shadows.len(),
                    error = %e,
                    "commit outcome unknown, keeping its pages until reopen"
                );
                self.shadows.clear();
                self.overflow_pending.clear();
                self.retired_pages.clear();
                self.retired_overflow.clear();
                self.state = TxnState::Aborted;
                Err(e)
            }
            Err(e) => {
                warn!(sequence = self.sequence, error = %e, "commit failed, rolling back");
                self.rollback();
                self.state = TxnState::Aborted;
                Err(e)
            }
        }
    }

    fn write_commit(&mut self) -> Result<u64> {
        let tree = self.tree;

        if !self.overflow_pending.is_empty() {
            for (range, data) in self.overflow_pending.values() {
                tree.overflow().write_at(*range, data)?;
            }
            tree.overflow().sync()?;
        }

        {
            let storage = tree.storage();
            let mut batch = storage.write_batch();
            for (page_id, buf) in self.shadows.iter_mut() {
                NodeViewMut::from_page(buf.as_mut_slice())?.set_is_copy(false);
                batch.sched_write(buf.as_slice(), *page_id)?;
            }
            for (i, chunk) in tree.bitmap().to_bytes().chunks(NODE_SIZE).enumerate() {
                batch.sched_write(chunk, 1 + i as u64)?;
            }
            batch.write_complete()?;
        }
        tree.storage().sync()?;

        tree.publish(self.root)
    }

    /// Discards every write of this transaction.
    pub fn abort(mut self) {
        if self.is_open() {
            self.rollback();
            self.state = TxnState::Aborted;
            debug!(sequence = self.sequence, "transaction aborted");
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, TxnState::Active | TxnState::Failed)
    }

    fn rollback(&mut self) {
        self.release_reserved();
        let bitmap = self.tree.bitmap();
        for (page_id, _) in self.shadows.drain() {
            bitmap.release_bit(page_id);
        }
        let overflow = self.tree.overflow();
        for (_, (range, _)) in std::mem::take(&mut self.overflow_pending) {
            overflow.release(range);
        }
        self.retired_pages.clear();
        self.retired_overflow.clear();
        self.root = self.snapshot_root;
    }
}

impl Drop for BpTxn<'_> {
    fn drop(&mut self) {
        if self.is_open() {
            if self.mode == TxnMode::ReadWrite && self.has_changes() {
                debug!(sequence = self.sequence, "dropping active transaction, rolling back");
            }
            self.rollback();
            self.state = TxnState::Aborted;
        }
        self.tree.release_snapshot(self.sequence);
    }
}

/// Moves the upper half of `left` into the empty node `right`, then inserts
/// `item` at `index` of the original node. Returns the first key of `right`.
fn split_into(
    left: &mut PageBuf,
    right: &mut PageBuf,
    right_id: u64,
    index: usize,
    item: &BpTreeItem<'_>,
) -> Result<Vec<u8>> {
    let mut left = NodeViewMut::from_page(left.as_mut_slice())?;
    let mut right = NodeViewMut::from_page(right.as_mut_slice())?;

    let n = left.num_entries();
    let mid = split_point(&left.as_ref())?;
    move_entries(&mut right, 0, &mut left, mid, n - mid)?;

    if !left.is_internal() {
        right.set_next_leaf(left.as_ref().next_leaf());
        left.set_next_leaf(right_id);
    }

    let outcome = if index <= mid {
        left.insert_entry(index, item)?
    } else {
        right.insert_entry(index - mid, item)?
    };
    ensure!(
        outcome == InsertOutcome::Inserted,
        "split left no room for a {}-byte entry",
        super::node::entry_size(item)
    );

    Ok(right.as_ref().key(0)?.to_vec())
}

/// First index of the upper half, splitting at the byte midpoint.
fn split_point(node: &NodeView<'_>) -> Result<usize> {
    let n = node.num_entries();
    ensure!(n >= 2, "cannot split a node with {} entries", n);

    let total = node.used_bytes() + n * DIRECTORY_SLOT_SIZE;
    let mut acc = 0;
    let mut mid = n - 1;
    for i in 0..n {
        acc += node.entry_size(i)? + DIRECTORY_SLOT_SIZE;
        if acc * 2 >= total {
            mid = i + 1;
            break;
        }
    }
    Ok(mid.clamp(1, n - 1))
}

/// Appends every entry of `right` to `left`. For internal nodes the entry 0
/// key of `right` is replaced by `separator` first. Returns false, leaving
/// `left` untouched, when the result would not fit in one node.
fn merge_into(left: &mut PageBuf, right: &mut PageBuf, separator: &[u8]) -> Result<bool> {
    let mut left = NodeViewMut::from_page(left.as_mut_slice())?;
    let mut right = NodeViewMut::from_page(right.as_mut_slice())?;

    if right.is_internal() && right.num_entries() > 0 {
        let child = right.as_ref().node_id(0)?;
        let entry = BpTreeItem::Internal {
            key: separator,
            child,
        };
        if right.set_entry(0, &entry)? == InsertOutcome::Overflow {
            return Ok(false);
        }
    }

    let (ln, rn) = (left.num_entries(), right.num_entries());
    let needed = right.used_bytes() + rn * DIRECTORY_SLOT_SIZE;
    if ln + rn > left.as_ref().max_entries() || left.free_space() < needed {
        return Ok(false);
    }

    let next = right.as_ref().next_leaf();
    move_entries(&mut left, ln, &mut right, 0, rn)?;
    if !left.is_internal() {
        left.set_next_leaf(next);
    }
    Ok(true)
}

/// Moves one entry across the boundary between siblings `left` and `right`
/// and rewrites their separator in `parent`. Returns false when any of the
/// three pages lacks room; the buffers are scratch copies in that case.
fn shift_one(
    left: &mut PageBuf,
    right: &mut PageBuf,
    parent: &mut PageBuf,
    left_slot: usize,
    right_id: u64,
    into_left: bool,
) -> Result<bool> {
    let mut left = NodeViewMut::from_page(left.as_mut_slice())?;
    let mut right = NodeViewMut::from_page(right.as_mut_slice())?;
    let mut parent = NodeViewMut::from_page(parent.as_mut_slice())?;
    let ln = left.num_entries();

    let separator = if !left.is_internal() {
        let (dst, src, src_index) = if into_left {
            (&mut left, &mut right, 0)
        } else {
            (&mut right, &mut left, ln - 1)
        };
        let size = src.as_ref().entry_size(src_index)?;
        if dst.num_entries() >= dst.as_ref().max_entries()
            || dst.free_space() < size + DIRECTORY_SLOT_SIZE
        {
            return Ok(false);
        }
        let dst_index = if into_left { dst.num_entries() } else { 0 };
        move_entries(dst, dst_index, src, src_index, 1)?;
        right.as_ref().key(0)?.to_vec()
    } else {
        let parent_key = parent.as_ref().key(left_slot + 1)?.to_vec();
        let first_child = right.as_ref().node_id(0)?;

        if into_left {
            let next_key = right.as_ref().key(1)?.to_vec();
            let entry = BpTreeItem::Internal {
                key: &parent_key,
                child: first_child,
            };
            if left.insert_entry(ln, &entry)? == InsertOutcome::Overflow {
                return Ok(false);
            }
            right.delete_entry(0)?;
            next_key
        } else {
            let last_key = left.as_ref().key(ln - 1)?.to_vec();
            let last_child = left.as_ref().node_id(ln - 1)?;
            let demoted = BpTreeItem::Internal {
                key: &parent_key,
                child: first_child,
            };
            if right.set_entry(0, &demoted)? == InsertOutcome::Overflow {
                return Ok(false);
            }
            let moved = BpTreeItem::Internal {
                key: &last_key,
                child: last_child,
            };
            if right.insert_entry(0, &moved)? == InsertOutcome::Overflow {
                return Ok(false);
            }
            left.delete_entry(ln - 1)?;
            last_key
        }
    };

    let entry = BpTreeItem::Internal {
        key: &separator,
        child: right_id,
    };
    Ok(parent.set_entry(left_slot + 1, &entry)? == InsertOutcome::Inserted)
}
