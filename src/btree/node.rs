//! # B+Tree Node Codec
//!
//! This module encodes and decodes B+tree nodes directly inside a page
//! buffer. It never allocates a page and never performs I/O; the tree engine
//! hands it a `NODE_SIZE` slice and it reads or rewrites that slice in place.
//!
//! ## Page Layout
//!
//! ```text
//! +---------------------------+ 0
//! | NodeHeader (32 bytes)     |
//! +---------------------------+ 32
//! | offset directory          |  u16 per entry, entry i at 32 + 2i,
//! | [0] [1] [2] ...           |  grows toward the end of the page
//! +---------------------------+
//! | free space                |
//! +---------------------------+ NODE_SIZE - used_bytes
//! | entry area                |  grows toward the header,
//! | (contiguous, no holes)    |  always exactly used_bytes long
//! +---------------------------+ NODE_SIZE
//! ```
//!
//! Directory slots hold page-absolute byte offsets and are kept in key
//! order; entry bytes are in whatever order they were inserted. Every
//! accessor goes through the directory, so reading entry `i` is O(1).
//!
//! ## Header (32 bytes, little endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------------
//! 0       1     page_type    0x01 internal, 0x02 leaf
//! 1       1     flags        bit 0: is_copy (uncommitted shadow)
//! 2       2     num_entries
//! 4       2     used_bytes   size of the entry area
//! 6       2     reserved
//! 8       8     parent       page id of the parent (advisory)
//! 16      8     next_leaf    right sibling leaf, 0 = none
//! 24      8     reserved
//! ```
//!
//! ## Entry Encodings
//!
//! The first byte of every entry is its [`BpTreeItemType`]:
//!
//! ```text
//! Leaf (1):      tag u8 | key_len u16 | value_len u32 | key | value
//! Overflow (2):  tag u8 | key_len u16 | value_len u32 | start u64 | end u64 | key
//! Internal (3):  tag u8 | key_len u16 | child u64 | key
//! ```
//!
//! Leaf and overflow entries live in leaf nodes, internal entries in
//! internal nodes. An overflow entry records where its value lives in the
//! overflow region; the codec never touches the value bytes themselves.
//!
//! ## Internal Node Semantics
//!
//! Entry `i` points at child `i`. For `i > 0` its key is a lower bound of
//! every key reachable through child `i`. The key of entry 0 is ignored
//! during descent and behaves as negative infinity.
//!
//! ## Capacity
//!
//! An insert fits when the node holds fewer than `MAX_LEAF_ENTRIES` /
//! `MAX_INTERNAL_ENTRIES` entries and the free space covers the entry plus
//! its directory slot. Otherwise [`InsertOutcome::Overflow`] is returned and
//! the page is left untouched; the caller splits. This is a signal, not an
//! error.
//!
//! ## Deletion
//!
//! Deleting an entry slides the entry bytes below it up by the entry's size
//! and adjusts the affected directory slots, so the entry area stays
//! contiguous and freed bytes are immediately reusable.

use std::cmp::Ordering;

use eyre::{bail, ensure, eyre, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    DIRECTORY_SLOT_SIZE, LEAF_ARRAY_SIZE, MAX_INLINE_VALUE, MAX_INTERNAL_ENTRIES, MAX_KEY_LEN,
    MAX_LEAF_ENTRIES, NODE_HEADER_SIZE, NODE_SIZE,
};
use crate::storage::PageType;

pub const FLAG_IS_COPY: u8 = 0x01;

const BODY_SIZE: usize = LEAF_ARRAY_SIZE;
const LEAF_ENTRY_HEADER: usize = 7;
const OVERFLOW_ENTRY_HEADER: usize = 23;
const INTERNAL_ENTRY_HEADER: usize = 11;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    page_type: u8,
    flags: u8,
    num_entries: U16,
    used_bytes: U16,
    reserved0: U16,
    parent: U64,
    next_leaf: U64,
    reserved1: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn new(page_type: PageType, parent: u64) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            num_entries: U16::new(0),
            used_bytes: U16::new(0),
            reserved0: U16::new(0),
            parent: U64::new(parent),
            next_leaf: U64::new(0),
            reserved1: [0u8; 8],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre!("failed to read NodeHeader: {:?}", e))
    }

    zerocopy_accessors! {
        num_entries: u16,
        used_bytes: u16,
        parent: u64,
        next_leaf: u64,
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpTreeItemType {
    Leaf = 1,
    Overflow = 2,
    Internal = 3,
}

impl BpTreeItemType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(BpTreeItemType::Leaf),
            2 => Some(BpTreeItemType::Overflow),
            3 => Some(BpTreeItemType::Internal),
            _ => None,
        }
    }
}

/// One decoded entry, borrowing its key (and inline value) from the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpTreeItem<'a> {
    Leaf {
        key: &'a [u8],
        value: &'a [u8],
    },
    Overflow {
        key: &'a [u8],
        value_len: u32,
        start: u64,
        end: u64,
    },
    Internal {
        key: &'a [u8],
        child: u64,
    },
}

impl<'a> BpTreeItem<'a> {
    pub fn key(&self) -> &'a [u8] {
        match *self {
            BpTreeItem::Leaf { key, .. }
            | BpTreeItem::Overflow { key, .. }
            | BpTreeItem::Internal { key, .. } => key,
        }
    }

    pub fn item_type(&self) -> BpTreeItemType {
        match self {
            BpTreeItem::Leaf { .. } => BpTreeItemType::Leaf,
            BpTreeItem::Overflow { .. } => BpTreeItemType::Overflow,
            BpTreeItem::Internal { .. } => BpTreeItemType::Internal,
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.key().len() <= MAX_KEY_LEN,
            "key length {} exceeds maximum {}",
            self.key().len(),
            MAX_KEY_LEN
        );
        if let BpTreeItem::Leaf { value, .. } = self {
            ensure!(
                value.len() <= MAX_INLINE_VALUE,
                "inline value length {} exceeds maximum {}",
                value.len(),
                MAX_INLINE_VALUE
            );
        }
        Ok(())
    }

    fn write_to(&self, out: &mut [u8]) {
        let key = self.key();
        out[0] = self.item_type() as u8;
        out[1..3].copy_from_slice(&(key.len() as u16).to_le_bytes());

        match *self {
            BpTreeItem::Leaf { value, .. } => {
                out[3..7].copy_from_slice(&(value.len() as u32).to_le_bytes());
                out[7..7 + key.len()].copy_from_slice(key);
                out[7 + key.len()..7 + key.len() + value.len()].copy_from_slice(value);
            }
            BpTreeItem::Overflow {
                value_len,
                start,
                end,
                ..
            } => {
                out[3..7].copy_from_slice(&value_len.to_le_bytes());
                out[7..15].copy_from_slice(&start.to_le_bytes());
                out[15..23].copy_from_slice(&end.to_le_bytes());
                out[23..23 + key.len()].copy_from_slice(key);
            }
            BpTreeItem::Internal { child, .. } => {
                out[3..11].copy_from_slice(&child.to_le_bytes());
                out[11..11 + key.len()].copy_from_slice(key);
            }
        }
    }
}

/// Serialized size of an entry, excluding its directory slot.
pub fn entry_size(item: &BpTreeItem<'_>) -> usize {
    match item {
        BpTreeItem::Leaf { key, value } => LEAF_ENTRY_HEADER + key.len() + value.len(),
        BpTreeItem::Overflow { key, .. } => OVERFLOW_ENTRY_HEADER + key.len(),
        BpTreeItem::Internal { key, .. } => INTERNAL_ENTRY_HEADER + key.len(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Overflow,
}

/// Location of a value stored in the overflow region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowRef {
    pub start: u64,
    pub end: u64,
    pub value_len: u32,
}

fn rd_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

fn rd_u32(b: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn rd_u64(b: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn split_page(data: &[u8]) -> Result<(&NodeHeader, &[u8])> {
    ensure!(
        data.len() == NODE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        NODE_SIZE
    );
    let (head, body) = data.split_at(NODE_HEADER_SIZE);
    let header = NodeHeader::from_bytes(head)?;
    ensure!(
        matches!(header.page_type(), PageType::Internal | PageType::Leaf),
        "expected tree node page, got type byte {:02x}",
        head[0]
    );
    ensure!(
        header.used_bytes() as usize + header.num_entries() as usize * DIRECTORY_SLOT_SIZE
            <= BODY_SIZE,
        "corrupt node: {} entries using {} bytes",
        header.num_entries(),
        header.used_bytes()
    );
    Ok((header, body))
}

/// Read-only view of a node page.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    header: &'a NodeHeader,
    body: &'a [u8],
}

/// Mutable view of a node page.
pub struct NodeViewMut<'a> {
    header: &'a mut NodeHeader,
    body: &'a mut [u8],
}

impl<'a> NodeView<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        let (header, body) = split_page(data)?;
        Ok(Self { header, body })
    }

    pub fn header(&self) -> &'a NodeHeader {
        self.header
    }

    pub fn num_entries(&self) -> usize {
        self.header.num_entries() as usize
    }

    pub fn used_bytes(&self) -> usize {
        self.header.used_bytes() as usize
    }

    pub fn free_space(&self) -> usize {
        BODY_SIZE - self.used_bytes() - self.num_entries() * DIRECTORY_SLOT_SIZE
    }

    pub fn is_internal(&self) -> bool {
        self.header.page_type() == PageType::Internal
    }

    pub fn is_leaf(&self) -> bool {
        self.header.page_type() == PageType::Leaf
    }

    pub fn is_copy(&self) -> bool {
        self.header.flags() & FLAG_IS_COPY != 0
    }

    pub fn parent(&self) -> u64 {
        self.header.parent()
    }

    pub fn next_leaf(&self) -> u64 {
        self.header.next_leaf()
    }

    pub fn max_entries(&self) -> usize {
        if self.is_internal() {
            MAX_INTERNAL_ENTRIES
        } else {
            MAX_LEAF_ENTRIES
        }
    }

    /// Whether `item` can be inserted without a split.
    pub fn fits(&self, item: &BpTreeItem<'_>) -> bool {
        self.num_entries() < self.max_entries()
            && self.free_space() >= entry_size(item) + DIRECTORY_SLOT_SIZE
    }

    /// Body-relative offset of entry `index`.
    fn entry_offset(&self, index: usize) -> Result<usize> {
        ensure!(
            index < self.num_entries(),
            "entry index {} out of bounds (num_entries={})",
            index,
            self.num_entries()
        );

        let abs = rd_u16(self.body, index * DIRECTORY_SLOT_SIZE) as usize;
        ensure!(
            abs >= NODE_HEADER_SIZE + BODY_SIZE - self.used_bytes() && abs < NODE_SIZE,
            "entry {} offset {} outside entry area",
            index,
            abs
        );
        Ok(abs - NODE_HEADER_SIZE)
    }

    fn entry_len_at(&self, off: usize) -> Result<usize> {
        let fixed = match BpTreeItemType::from_byte(self.body[off]) {
            Some(BpTreeItemType::Leaf) => LEAF_ENTRY_HEADER,
            Some(BpTreeItemType::Overflow) => OVERFLOW_ENTRY_HEADER,
            Some(BpTreeItemType::Internal) => INTERNAL_ENTRY_HEADER,
            None => bail!("unknown entry tag {:02x} at offset {}", self.body[off], off),
        };
        ensure!(
            off + fixed <= BODY_SIZE,
            "entry header at {} extends beyond page",
            off
        );

        let key_len = rd_u16(self.body, off + 1) as usize;
        let len = if self.body[off] == BpTreeItemType::Leaf as u8 {
            fixed + key_len + rd_u32(self.body, off + 3) as usize
        } else {
            fixed + key_len
        };
        ensure!(
            off + len <= BODY_SIZE,
            "entry at {} with length {} extends beyond page",
            off,
            len
        );
        Ok(len)
    }

    /// Serialized size of entry `index`.
    pub fn entry_size(&self, index: usize) -> Result<usize> {
        let off = self.entry_offset(index)?;
        self.entry_len_at(off)
    }

    /// Raw encoded bytes of entry `index`.
    pub fn entry_bytes(&self, index: usize) -> Result<&'a [u8]> {
        let off = self.entry_offset(index)?;
        let len = self.entry_len_at(off)?;
        Ok(&self.body[off..off + len])
    }

    pub fn item_type(&self, index: usize) -> Result<BpTreeItemType> {
        let off = self.entry_offset(index)?;
        BpTreeItemType::from_byte(self.body[off])
            .ok_or_else(|| eyre!("unknown entry tag {:02x}", self.body[off]))
    }

    pub fn item(&self, index: usize) -> Result<BpTreeItem<'a>> {
        let body: &'a [u8] = self.body;
        let off = self.entry_offset(index)?;
        self.entry_len_at(off)?;
        let key_len = rd_u16(body, off + 1) as usize;

        Ok(match BpTreeItemType::from_byte(body[off]) {
            Some(BpTreeItemType::Leaf) => {
                let value_len = rd_u32(body, off + 3) as usize;
                let key_start = off + LEAF_ENTRY_HEADER;
                BpTreeItem::Leaf {
                    key: &body[key_start..key_start + key_len],
                    value: &body[key_start + key_len..key_start + key_len + value_len],
                }
            }
            Some(BpTreeItemType::Overflow) => {
                let key_start = off + OVERFLOW_ENTRY_HEADER;
                BpTreeItem::Overflow {
                    key: &body[key_start..key_start + key_len],
                    value_len: rd_u32(body, off + 3),
                    start: rd_u64(body, off + 7),
                    end: rd_u64(body, off + 15),
                }
            }
            Some(BpTreeItemType::Internal) => {
                let key_start = off + INTERNAL_ENTRY_HEADER;
                BpTreeItem::Internal {
                    key: &body[key_start..key_start + key_len],
                    child: rd_u64(body, off + 3),
                }
            }
            None => bail!("unknown entry tag {:02x}", body[off]),
        })
    }

    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        Ok(self.item(index)?.key())
    }

    pub fn key_len(&self, index: usize) -> Result<usize> {
        let off = self.entry_offset(index)?;
        Ok(rd_u16(self.body, off + 1) as usize)
    }

    /// Inline value of a leaf entry.
    pub fn value(&self, index: usize) -> Result<&'a [u8]> {
        match self.item(index)? {
            BpTreeItem::Leaf { value, .. } => Ok(value),
            BpTreeItem::Overflow { .. } => {
                bail!("entry {} stores its value in the overflow region", index)
            }
            BpTreeItem::Internal { .. } => bail!("entry {} is an internal entry", index),
        }
    }

    /// Logical value length of a leaf or overflow entry.
    pub fn value_len(&self, index: usize) -> Result<usize> {
        match self.item(index)? {
            BpTreeItem::Leaf { value, .. } => Ok(value.len()),
            BpTreeItem::Overflow { value_len, .. } => Ok(value_len as usize),
            BpTreeItem::Internal { .. } => bail!("entry {} is an internal entry", index),
        }
    }

    pub fn is_overflow(&self, index: usize) -> Result<bool> {
        Ok(self.item_type(index)? == BpTreeItemType::Overflow)
    }

    pub fn overflow(&self, index: usize) -> Result<OverflowRef> {
        match self.item(index)? {
            BpTreeItem::Overflow {
                value_len,
                start,
                end,
                ..
            } => Ok(OverflowRef {
                start,
                end,
                value_len,
            }),
            _ => bail!("entry {} is not an overflow entry", index),
        }
    }

    /// Child page id of an internal entry.
    pub fn node_id(&self, index: usize) -> Result<u64> {
        match self.item(index)? {
            BpTreeItem::Internal { child, .. } => Ok(child),
            _ => bail!("entry {} is not an internal entry", index),
        }
    }

    /// First index in `from..num_entries` whose key is not less than the
    /// target. `cmp` compares an entry key against the target.
    pub fn lower_bound<F>(&self, from: usize, mut cmp: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Ordering,
    {
        let (mut lo, mut hi) = (from, self.num_entries());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key(mid)?) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First index in `from..num_entries` whose key is greater than the
    /// target.
    pub fn upper_bound<F>(&self, from: usize, mut cmp: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Ordering,
    {
        let (mut lo, mut hi) = (from, self.num_entries());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self.key(mid)?) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}

impl<'a> NodeViewMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        split_page(data)?;
        let (head, body) = data.split_at_mut(NODE_HEADER_SIZE);
        let header = NodeHeader::from_bytes_mut(head)?;
        Ok(Self { header, body })
    }

    /// Formats `data` as an empty node.
    pub fn init(data: &'a mut [u8], parent: u64, is_internal: bool) -> Result<Self> {
        ensure!(
            data.len() == NODE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            NODE_SIZE
        );

        data.fill(0);
        let page_type = if is_internal {
            PageType::Internal
        } else {
            PageType::Leaf
        };
        let (head, body) = data.split_at_mut(NODE_HEADER_SIZE);
        let header = NodeHeader::from_bytes_mut(head)?;
        *header = NodeHeader::new(page_type, parent);

        Ok(Self { header, body })
    }

    pub fn as_ref(&self) -> NodeView<'_> {
        NodeView {
            header: &*self.header,
            body: &*self.body,
        }
    }

    pub fn num_entries(&self) -> usize {
        self.as_ref().num_entries()
    }

    pub fn used_bytes(&self) -> usize {
        self.as_ref().used_bytes()
    }

    pub fn free_space(&self) -> usize {
        self.as_ref().free_space()
    }

    pub fn is_internal(&self) -> bool {
        self.as_ref().is_internal()
    }

    pub fn set_parent(&mut self, parent: u64) {
        self.header.set_parent(parent);
    }

    pub fn set_next_leaf(&mut self, next: u64) {
        self.header.set_next_leaf(next);
    }

    pub fn set_is_copy(&mut self, is_copy: bool) {
        let flags = self.header.flags();
        self.header.set_flags(if is_copy {
            flags | FLAG_IS_COPY
        } else {
            flags & !FLAG_IS_COPY
        });
    }

    fn check_item(&self, item: &BpTreeItem<'_>) -> Result<()> {
        item.validate()?;
        let internal_item = matches!(item, BpTreeItem::Internal { .. });
        ensure!(
            internal_item == self.is_internal(),
            "cannot store {:?} entry in {} node",
            item.item_type(),
            if self.is_internal() { "internal" } else { "leaf" }
        );
        Ok(())
    }

    fn dir_get(&self, index: usize) -> usize {
        rd_u16(self.body, index * DIRECTORY_SLOT_SIZE) as usize
    }

    fn dir_set(&mut self, index: usize, abs: usize) {
        let at = index * DIRECTORY_SLOT_SIZE;
        self.body[at..at + DIRECTORY_SLOT_SIZE].copy_from_slice(&(abs as u16).to_le_bytes());
    }

    /// Places `len` bytes at the low end of the entry area and opens a
    /// directory slot at `index` for them. Capacity must already be checked.
    fn place(&mut self, index: usize, len: usize) -> usize {
        let n = self.num_entries();
        let used = self.used_bytes();
        let off = BODY_SIZE - used - len;

        let dir_start = index * DIRECTORY_SLOT_SIZE;
        let dir_end = n * DIRECTORY_SLOT_SIZE;
        self.body
            .copy_within(dir_start..dir_end, dir_start + DIRECTORY_SLOT_SIZE);
        self.dir_set(index, off + NODE_HEADER_SIZE);

        self.header.set_num_entries(n as u16 + 1);
        self.header.set_used_bytes((used + len) as u16);
        off
    }

    fn insert_raw(&mut self, index: usize, raw: &[u8]) {
        let off = self.place(index, raw.len());
        self.body[off..off + raw.len()].copy_from_slice(raw);
    }

    /// Inserts `item` at logical position `index`. Returns
    /// [`InsertOutcome::Overflow`] without touching the page when it does
    /// not fit.
    pub fn insert_entry(&mut self, index: usize, item: &BpTreeItem<'_>) -> Result<InsertOutcome> {
        self.check_item(item)?;
        ensure!(
            index <= self.num_entries(),
            "insert index {} out of bounds (num_entries={})",
            index,
            self.num_entries()
        );

        if !self.as_ref().fits(item) {
            return Ok(InsertOutcome::Overflow);
        }

        let len = entry_size(item);
        let off = self.place(index, len);
        item.write_to(&mut self.body[off..off + len]);
        Ok(InsertOutcome::Inserted)
    }

    /// Replaces entry `index` with `item`.
    pub fn set_entry(&mut self, index: usize, item: &BpTreeItem<'_>) -> Result<InsertOutcome> {
        self.check_item(item)?;
        let old_len = self.as_ref().entry_size(index)?;
        let new_len = entry_size(item);

        if new_len > old_len && self.free_space() < new_len - old_len {
            return Ok(InsertOutcome::Overflow);
        }

        self.delete_entry(index)?;
        let off = self.place(index, new_len);
        item.write_to(&mut self.body[off..off + new_len]);
        Ok(InsertOutcome::Inserted)
    }

    /// Rewrites the child pointer of internal entry `index` in place.
    pub fn set_node_id(&mut self, index: usize, child: u64) -> Result<()> {
        let view = self.as_ref();
        let off = view.entry_offset(index)?;
        ensure!(
            view.item_type(index)? == BpTreeItemType::Internal,
            "entry {} is not an internal entry",
            index
        );
        self.body[off + 3..off + 11].copy_from_slice(&child.to_le_bytes());
        Ok(())
    }

    /// Removes entry `index`, compacting the entry area.
    pub fn delete_entry(&mut self, index: usize) -> Result<()> {
        let (off, len) = {
            let view = self.as_ref();
            let off = view.entry_offset(index)?;
            (off, view.entry_len_at(off)?)
        };

        let n = self.num_entries();
        let used = self.used_bytes();
        let start = BODY_SIZE - used;

        self.body.copy_within(start..off, start + len);
        self.body[start..start + len].fill(0);

        let moved_below = off + NODE_HEADER_SIZE;
        for j in 0..n {
            if j == index {
                continue;
            }
            let abs = self.dir_get(j);
            if abs < moved_below {
                self.dir_set(j, abs + len);
            }
        }

        let dir_start = (index + 1) * DIRECTORY_SLOT_SIZE;
        let dir_end = n * DIRECTORY_SLOT_SIZE;
        self.body
            .copy_within(dir_start..dir_end, index * DIRECTORY_SLOT_SIZE);
        self.body[dir_end - DIRECTORY_SLOT_SIZE..dir_end].fill(0);

        self.header.set_num_entries(n as u16 - 1);
        self.header.set_used_bytes((used - len) as u16);
        Ok(())
    }

    /// Keeps only the entries for which `keep` returns true, rebuilding the
    /// entry area.
    fn retain_indices<F>(&mut self, mut keep: F) -> Result<()>
    where
        F: FnMut(usize) -> bool,
    {
        let n = self.num_entries();
        let mut scratch = Vec::with_capacity(self.used_bytes());
        let mut lens = Vec::with_capacity(n);
        {
            let view = self.as_ref();
            for i in 0..n {
                if keep(i) {
                    let raw = view.entry_bytes(i)?;
                    scratch.extend_from_slice(raw);
                    lens.push(raw.len());
                }
            }
        }

        self.body.fill(0);
        self.header.set_num_entries(0);
        self.header.set_used_bytes(0);

        let mut pos = 0;
        for (i, len) in lens.into_iter().enumerate() {
            self.insert_raw(i, &scratch[pos..pos + len]);
            pos += len;
        }
        Ok(())
    }

    /// Removes entries `from..num_entries`.
    pub fn truncate(&mut self, from: usize) -> Result<()> {
        self.retain_indices(|i| i < from)
    }
}

/// Moves `count` entries starting at `src_start` in `src` to position
/// `dst_start` in `dst`, preserving their order. Capacity is checked before
/// anything is written: on error neither node has changed.
pub fn move_entries(
    dst: &mut NodeViewMut<'_>,
    dst_start: usize,
    src: &mut NodeViewMut<'_>,
    src_start: usize,
    count: usize,
) -> Result<()> {
    ensure!(
        dst.is_internal() == src.is_internal(),
        "cannot move entries between internal and leaf nodes"
    );
    ensure!(
        src_start + count <= src.num_entries(),
        "move range {}..{} out of bounds (num_entries={})",
        src_start,
        src_start + count,
        src.num_entries()
    );
    ensure!(
        dst_start <= dst.num_entries(),
        "move destination {} out of bounds (num_entries={})",
        dst_start,
        dst.num_entries()
    );

    if count == 0 {
        return Ok(());
    }

    let mut scratch = Vec::new();
    let mut lens = Vec::with_capacity(count);
    {
        let view = src.as_ref();
        for i in src_start..src_start + count {
            let raw = view.entry_bytes(i)?;
            scratch.extend_from_slice(raw);
            lens.push(raw.len());
        }
    }

    let dst_view = dst.as_ref();
    if dst_view.num_entries() + count > dst_view.max_entries()
        || dst_view.free_space() < scratch.len() + count * DIRECTORY_SLOT_SIZE
    {
        bail!(
            "cannot move {} entries ({} bytes): destination has {} free bytes",
            count,
            scratch.len(),
            dst_view.free_space()
        );
    }

    let mut pos = 0;
    for (i, len) in lens.into_iter().enumerate() {
        dst.insert_raw(dst_start + i, &scratch[pos..pos + len]);
        pos += len;
    }

    src.retain_indices(|i| i < src_start || i >= src_start + count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &'static [u8], value: &'static [u8]) -> BpTreeItem<'static> {
        BpTreeItem::Leaf { key, value }
    }

    fn keys(node: &NodeView<'_>) -> Vec<Vec<u8>> {
        (0..node.num_entries())
            .map(|i| node.key(i).unwrap().to_vec())
            .collect()
    }

    #[test]
    fn node_header_is_32_bytes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), 32);
    }

    #[test]
    fn init_creates_empty_leaf() {
        let mut page = vec![0xFFu8; NODE_SIZE];
        let node = NodeViewMut::init(&mut page, 7, false).unwrap();

        assert_eq!(node.num_entries(), 0);
        assert_eq!(node.used_bytes(), 0);
        assert!(!node.is_internal());
        assert_eq!(node.as_ref().parent(), 7);
        assert_eq!(node.as_ref().next_leaf(), 0);
        assert_eq!(node.free_space(), NODE_SIZE - NODE_HEADER_SIZE);
        assert_eq!(page[0], PageType::Leaf as u8);
    }

    #[test]
    fn from_page_rejects_unformatted_page() {
        let page = vec![0u8; NODE_SIZE];
        let result = NodeView::from_page(&page);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("expected tree node"));
    }

    #[test]
    fn from_page_rejects_wrong_size() {
        let page = vec![0u8; 100];
        assert!(NodeView::from_page(&page).is_err());
    }

    #[test]
    fn leaf_node_insert_and_read_single_entry() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        let outcome = node.insert_entry(0, &leaf(b"apple", b"red")).unwrap();

        assert_eq!(outcome, InsertOutcome::Inserted);
        let view = node.as_ref();
        assert_eq!(view.num_entries(), 1);
        assert_eq!(view.key(0).unwrap(), b"apple");
        assert_eq!(view.value(0).unwrap(), b"red");
        assert_eq!(view.key_len(0).unwrap(), 5);
        assert_eq!(view.value_len(0).unwrap(), 3);
        assert_eq!(view.item_type(0).unwrap(), BpTreeItemType::Leaf);
        assert!(!view.is_overflow(0).unwrap());
        assert_eq!(view.used_bytes(), 7 + 5 + 3);
    }

    #[test]
    fn insert_at_index_keeps_directory_order() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        node.insert_entry(0, &leaf(b"b", b"2")).unwrap();
        node.insert_entry(0, &leaf(b"a", b"1")).unwrap();
        node.insert_entry(2, &leaf(b"d", b"4")).unwrap();
        node.insert_entry(2, &leaf(b"c", b"3")).unwrap();

        assert_eq!(
            keys(&node.as_ref()),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
        assert_eq!(node.as_ref().value(2).unwrap(), b"3");
    }

    #[test]
    fn insert_out_of_range_index_errors() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        assert!(node.insert_entry(1, &leaf(b"a", b"1")).is_err());
    }

    #[test]
    fn insert_rejects_oversized_key_and_value() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        let big_key = vec![0u8; MAX_KEY_LEN + 1];
        let big_value = vec![0u8; MAX_INLINE_VALUE + 1];

        assert!(node
            .insert_entry(0, &BpTreeItem::Leaf { key: &big_key, value: b"" })
            .is_err());
        assert!(node
            .insert_entry(0, &BpTreeItem::Leaf { key: b"k", value: &big_value })
            .is_err());
    }

    #[test]
    fn insert_rejects_mismatched_entry_kind() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        let result = node.insert_entry(0, &BpTreeItem::Internal { key: b"k", child: 3 });

        assert!(result.is_err());
    }

    #[test]
    fn insert_overflow_on_entry_cap_leaves_node_unchanged() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        for i in 0..MAX_LEAF_ENTRIES {
            let key = (i as u32).to_be_bytes();
            let outcome = node
                .insert_entry(i, &BpTreeItem::Leaf { key: &key, value: b"v" })
                .unwrap();
            assert_eq!(outcome, InsertOutcome::Inserted);
        }
        let used = node.used_bytes();

        let outcome = node
            .insert_entry(0, &BpTreeItem::Leaf { key: b"zz", value: b"v" })
            .unwrap();

        assert_eq!(outcome, InsertOutcome::Overflow);
        assert_eq!(node.num_entries(), MAX_LEAF_ENTRIES);
        assert_eq!(node.used_bytes(), used);
    }

    #[test]
    fn insert_overflow_on_byte_capacity() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        let value = vec![7u8; MAX_INLINE_VALUE];

        let mut inserted = 0;
        loop {
            let key = (inserted as u32).to_be_bytes();
            let item = BpTreeItem::Leaf { key: &key, value: &value };
            match node.insert_entry(inserted, &item).unwrap() {
                InsertOutcome::Inserted => inserted += 1,
                InsertOutcome::Overflow => break,
            }
        }

        let per_entry = 7 + 4 + MAX_INLINE_VALUE + DIRECTORY_SLOT_SIZE;
        assert_eq!(inserted, (NODE_SIZE - NODE_HEADER_SIZE) / per_entry);
        assert!(node.free_space() < per_entry);
    }

    #[test]
    fn delete_compacts_and_frees_bytes() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        node.insert_entry(0, &leaf(b"a", b"11111")).unwrap();
        node.insert_entry(1, &leaf(b"b", b"22")).unwrap();
        node.insert_entry(2, &leaf(b"c", b"3333333")).unwrap();
        let free_before = node.free_space();

        node.delete_entry(1).unwrap();

        let view = node.as_ref();
        assert_eq!(view.num_entries(), 2);
        assert_eq!(view.key(0).unwrap(), b"a");
        assert_eq!(view.value(0).unwrap(), b"11111");
        assert_eq!(view.key(1).unwrap(), b"c");
        assert_eq!(view.value(1).unwrap(), b"3333333");
        assert_eq!(view.free_space(), free_before + 7 + 1 + 2 + DIRECTORY_SLOT_SIZE);
        assert_eq!(view.used_bytes(), (7 + 1 + 5) + (7 + 1 + 7));
    }

    #[test]
    fn delete_everything_restores_empty_node() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        for (i, k) in [b"x", b"y", b"z"].iter().enumerate() {
            node.insert_entry(i, &BpTreeItem::Leaf { key: *k, value: b"val" })
                .unwrap();
        }

        node.delete_entry(2).unwrap();
        node.delete_entry(0).unwrap();
        node.delete_entry(0).unwrap();

        assert_eq!(node.num_entries(), 0);
        assert_eq!(node.used_bytes(), 0);
        assert_eq!(node.free_space(), NODE_SIZE - NODE_HEADER_SIZE);
    }

    #[test]
    fn set_entry_grows_and_shrinks() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        node.insert_entry(0, &leaf(b"a", b"1")).unwrap();
        node.insert_entry(1, &leaf(b"b", b"2")).unwrap();

        node.set_entry(0, &leaf(b"a", b"a much longer value"))
            .unwrap();
        assert_eq!(node.as_ref().value(0).unwrap(), b"a much longer value");
        assert_eq!(node.as_ref().value(1).unwrap(), b"2");

        node.set_entry(0, &leaf(b"a", b"")).unwrap();
        assert_eq!(node.as_ref().value(0).unwrap(), b"");
        assert_eq!(node.used_bytes(), 8 + 9);
    }

    #[test]
    fn internal_entries_store_children() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, true).unwrap();
        node.insert_entry(0, &BpTreeItem::Internal { key: b"", child: 10 })
            .unwrap();
        node.insert_entry(1, &BpTreeItem::Internal { key: b"m", child: 11 })
            .unwrap();

        node.set_node_id(1, 99).unwrap();

        let view = node.as_ref();
        assert!(view.is_internal());
        assert_eq!(view.node_id(0).unwrap(), 10);
        assert_eq!(view.node_id(1).unwrap(), 99);
        assert_eq!(view.key(1).unwrap(), b"m");
        assert!(view.value(1).is_err());
    }

    #[test]
    fn overflow_entry_accessors() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        let item = BpTreeItem::Overflow {
            key: b"blob",
            value_len: 50_000,
            start: 4096,
            end: 54_096,
        };

        node.insert_entry(0, &item).unwrap();

        let view = node.as_ref();
        assert!(view.is_overflow(0).unwrap());
        assert_eq!(view.value_len(0).unwrap(), 50_000);
        assert_eq!(
            view.overflow(0).unwrap(),
            OverflowRef {
                start: 4096,
                end: 54_096,
                value_len: 50_000
            }
        );
        assert!(view.value(0).is_err());
        assert_eq!(view.item(0).unwrap(), item);
        assert_eq!(entry_size(&item), 23 + 4);
    }

    #[test]
    fn move_entries_splits_node_in_order() {
        let mut left_page = vec![0u8; NODE_SIZE];
        let mut right_page = vec![0u8; NODE_SIZE];
        let mut left = NodeViewMut::init(&mut left_page, 0, false).unwrap();
        let mut right = NodeViewMut::init(&mut right_page, 0, false).unwrap();
        for i in 0..10u8 {
            left.insert_entry(i as usize, &BpTreeItem::Leaf { key: &[i], value: &[i, i] })
                .unwrap();
        }

        move_entries(&mut right, 0, &mut left, 6, 4).unwrap();

        assert_eq!(left.num_entries(), 6);
        assert_eq!(right.num_entries(), 4);
        assert_eq!(right.as_ref().key(0).unwrap(), &[6]);
        assert_eq!(right.as_ref().value(3).unwrap(), &[9, 9]);
        assert_eq!(left.as_ref().key(5).unwrap(), &[5]);
        assert_eq!(left.used_bytes(), 6 * (7 + 1 + 2));
    }

    #[test]
    fn move_entries_to_front_of_destination() {
        let mut a_page = vec![0u8; NODE_SIZE];
        let mut b_page = vec![0u8; NODE_SIZE];
        let mut a = NodeViewMut::init(&mut a_page, 0, false).unwrap();
        let mut b = NodeViewMut::init(&mut b_page, 0, false).unwrap();
        a.insert_entry(0, &leaf(b"a", b"")).unwrap();
        a.insert_entry(1, &leaf(b"b", b"")).unwrap();
        b.insert_entry(0, &leaf(b"c", b"")).unwrap();

        move_entries(&mut b, 0, &mut a, 1, 1).unwrap();

        assert_eq!(keys(&a.as_ref()), vec![b"a".to_vec()]);
        assert_eq!(keys(&b.as_ref()), vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn move_entries_without_room_changes_nothing() {
        let mut full_page = vec![0u8; NODE_SIZE];
        let mut src_page = vec![0u8; NODE_SIZE];
        let mut full = NodeViewMut::init(&mut full_page, 0, false).unwrap();
        let mut src = NodeViewMut::init(&mut src_page, 0, false).unwrap();
        let value = vec![1u8; MAX_INLINE_VALUE];
        let mut i = 0usize;
        while full
            .insert_entry(i, &BpTreeItem::Leaf { key: &(i as u32).to_be_bytes(), value: &value })
            .unwrap()
            == InsertOutcome::Inserted
        {
            i += 1;
        }
        src.insert_entry(0, &BpTreeItem::Leaf { key: b"x", value: &value })
            .unwrap();
        src.insert_entry(1, &BpTreeItem::Leaf { key: b"y", value: &value })
            .unwrap();
        let (full_n, src_n) = (full.num_entries(), src.num_entries());

        let result = move_entries(&mut full, 0, &mut src, 0, 2);

        assert!(result.is_err());
        assert_eq!(full.num_entries(), full_n);
        assert_eq!(src.num_entries(), src_n);
        assert_eq!(src.as_ref().key(1).unwrap(), b"y");
    }

    #[test]
    fn truncate_drops_tail_entries() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        for i in 0..5u8 {
            node.insert_entry(i as usize, &BpTreeItem::Leaf { key: &[i], value: b"" })
                .unwrap();
        }

        node.truncate(2).unwrap();

        assert_eq!(keys(&node.as_ref()), vec![vec![0u8], vec![1u8]]);
        assert_eq!(node.used_bytes(), 2 * 8);
    }

    #[test]
    fn bounds_with_duplicate_keys() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();
        for (i, k) in [b"a", b"b", b"b", b"b", b"c"].iter().enumerate() {
            node.insert_entry(i, &BpTreeItem::Leaf { key: *k, value: b"" })
                .unwrap();
        }
        let view = node.as_ref();

        assert_eq!(view.lower_bound(0, |k| k.cmp(b"b")).unwrap(), 1);
        assert_eq!(view.upper_bound(0, |k| k.cmp(b"b")).unwrap(), 4);
        assert_eq!(view.lower_bound(0, |k| k.cmp(b"0")).unwrap(), 0);
        assert_eq!(view.upper_bound(0, |k| k.cmp(b"z")).unwrap(), 5);
        assert_eq!(view.lower_bound(2, |k| k.cmp(b"a")).unwrap(), 2);
    }

    #[test]
    fn is_copy_flag_round_trips() {
        let mut page = vec![0u8; NODE_SIZE];
        let mut node = NodeViewMut::init(&mut page, 0, false).unwrap();

        assert!(!node.as_ref().is_copy());
        node.set_is_copy(true);
        assert!(node.as_ref().is_copy());
        node.set_is_copy(false);
        assert!(!node.as_ref().is_copy());
    }

    #[test]
    fn reopened_view_reads_same_entries() {
        let mut page = vec![0u8; NODE_SIZE];
        {
            let mut node = NodeViewMut::init(&mut page, 3, false).unwrap();
            node.insert_entry(0, &leaf(b"k1", b"v1")).unwrap();
            node.insert_entry(1, &leaf(b"k2", b"v2")).unwrap();
            node.set_next_leaf(42);
        }

        let view = NodeView::from_page(&page).unwrap();

        assert_eq!(view.num_entries(), 2);
        assert_eq!(view.value(1).unwrap(), b"v2");
        assert_eq!(view.next_leaf(), 42);
        assert_eq!(view.parent(), 3);
    }
}
