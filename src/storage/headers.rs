//! # Super-Block
//!
//! Page 0 of a tree file holds the super-block: the record of which root page
//! is committed and at which sequence number. It is the only page that is
//! ever rewritten in place, so it is protected by a dual-slot scheme.
//!
//! ## Layout
//!
//! ```text
//! Page 0 (NODE_SIZE bytes)
//! +-----------------------+  0
//! | slot 0 (128 bytes)    |  <- even sequence numbers
//! +-----------------------+  128
//! | slot 1 (128 bytes)    |  <- odd sequence numbers
//! +-----------------------+  256
//! | zero                  |
//! +-----------------------+
//! ```
//!
//! ## Slot Layout (128 bytes, little endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------------------
//! 0       16    magic
//! 16      4     version
//! 20      4     node_size
//! 24      8     file_size       bytes, total_pages × node_size
//! 32      8     total_pages
//! 40      8     bitmap_start    first bitmap page (always 1)
//! 48      8     bitmap_pages
//! 56      8     root_page_id
//! 64      8     sequence
//! 72      8     overflow_tail   end of the overflow region
//! 80      4     checksum        CRC-32 of bytes 0..80
//! 84      44    reserved
//! ```
//!
//! ## Commit Protocol
//!
//! A commit with sequence `s` writes slot `s % 2`, leaving the slot of
//! sequence `s - 1` untouched. A torn write therefore damages at most the
//! slot being written, which then fails its checksum; open falls back to the
//! other slot. Open always picks the valid slot with the highest sequence.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{NODE_SIZE, SUPERBLOCK_SLOTS, SUPERBLOCK_SLOT_SIZE};

pub const SUPERBLOCK_MAGIC: &[u8; 16] = b"cowtree bptree\x00\x00";
pub const CURRENT_VERSION: u32 = 1;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CHECKSUM_OFFSET: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SuperBlock {
    magic: [u8; 16],
    version: U32,
    node_size: U32,
    file_size: U64,
    total_pages: U64,
    bitmap_start: U64,
    bitmap_pages: U64,
    root_page_id: U64,
    sequence: U64,
    overflow_tail: U64,
    checksum: U32,
    reserved: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<SuperBlock>() == SUPERBLOCK_SLOT_SIZE);

impl SuperBlock {
    pub fn new(total_pages: u64, bitmap_pages: u64, root_page_id: u64) -> Self {
        Self {
            magic: *SUPERBLOCK_MAGIC,
            version: U32::new(CURRENT_VERSION),
            node_size: U32::new(NODE_SIZE as u32),
            file_size: U64::new(total_pages * NODE_SIZE as u64),
            total_pages: U64::new(total_pages),
            bitmap_start: U64::new(1),
            bitmap_pages: U64::new(bitmap_pages),
            root_page_id: U64::new(root_page_id),
            sequence: U64::new(0),
            overflow_tail: U64::new(0),
            checksum: U32::new(0),
            reserved: [0u8; 44],
        }
    }

    zerocopy_accessors! {
        version: u32,
        node_size: u32,
        file_size: u64,
        total_pages: u64,
        bitmap_start: u64,
        bitmap_pages: u64,
        root_page_id: u64,
        sequence: u64,
        overflow_tail: u64,
        checksum: u32,
    }

    fn compute_checksum(&self) -> u32 {
        CRC32.checksum(&self.as_bytes()[..CHECKSUM_OFFSET])
    }

    /// Returns the slot this super-block is written to.
    pub fn slot_index(&self) -> usize {
        (self.sequence() % SUPERBLOCK_SLOTS as u64) as usize
    }

    /// Parses and validates one slot. Returns `None` for a blank, torn or
    /// foreign slot.
    pub fn parse_slot(bytes: &[u8]) -> Option<Self> {
        let slot = Self::read_from_bytes(bytes.get(..SUPERBLOCK_SLOT_SIZE)?).ok()?;

        if &slot.magic != SUPERBLOCK_MAGIC
            || slot.version() != CURRENT_VERSION
            || slot.node_size() as usize != NODE_SIZE
            || slot.checksum() != slot.compute_checksum()
        {
            return None;
        }

        Some(slot)
    }

    /// Picks the valid slot with the highest sequence from a page 0 image.
    pub fn from_page(page: &[u8]) -> Result<Self> {
        ensure!(
            page.len() >= SUPERBLOCK_SLOT_SIZE * SUPERBLOCK_SLOTS,
            "buffer too small for super-block: {} < {}",
            page.len(),
            SUPERBLOCK_SLOT_SIZE * SUPERBLOCK_SLOTS
        );

        let newest = (0..SUPERBLOCK_SLOTS)
            .filter_map(|i| {
                let start = i * SUPERBLOCK_SLOT_SIZE;
                Self::parse_slot(&page[start..start + SUPERBLOCK_SLOT_SIZE])
            })
            .max_by_key(|slot| slot.sequence());

        match newest {
            Some(slot) => Ok(slot),
            None => bail!("no valid super-block slot found"),
        }
    }

    /// Seals the checksum and writes this super-block into its slot of a
    /// page 0 image. The other slot is left untouched.
    pub fn write_to_page(&mut self, page: &mut [u8]) -> Result<()> {
        ensure!(
            page.len() >= SUPERBLOCK_SLOT_SIZE * SUPERBLOCK_SLOTS,
            "buffer too small for super-block: {} < {}",
            page.len(),
            SUPERBLOCK_SLOT_SIZE * SUPERBLOCK_SLOTS
        );

        self.set_checksum(self.compute_checksum());
        let start = self.slot_index() * SUPERBLOCK_SLOT_SIZE;
        page[start..start + SUPERBLOCK_SLOT_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// Builds the next commit record: same geometry, new root, sequence + 1.
    pub fn next_commit(&self, root_page_id: u64, overflow_tail: u64) -> Self {
        let mut next = *self;
        next.set_root_page_id(root_page_id);
        next.set_overflow_tail(overflow_tail);
        next.set_sequence(self.sequence() + 1);
        next
    }
}
