//! # Free-Space Bitmap
//!
//! This module implements page allocation for the tree file. One bit per page
//! records whether the page is in use; a set bit means allocated.
//!
//! ## Design Overview
//!
//! The bitmap is an array of `AtomicU64` words. Allocation claims the lowest
//! clear bit of a word with a compare-and-swap, so any number of threads can
//! allocate and release concurrently without a lock:
//!
//! ```text
//! last_free_word ─┐
//!                 v
//! word:   [0] [1] [2] [3] ... [n-1]
//!          │   │   │   │        │
//!          full full ▼         (scan wraps around to [0])
//!                  0b...0111
//!                       ^ lowest clear bit, claimed by CAS
//! ```
//!
//! The scan starts at `last_free_word`, a hint updated by successful
//! allocations and by releases, and wraps around every word once before
//! reporting exhaustion.
//!
//! ## Padding Bits
//!
//! When the page count is not a multiple of 64, the bits past the end of the
//! last word are permanently set so they can never be handed out.
//!
//! ## On-Disk Region
//!
//! The bitmap is persisted in the pages following the super-block. Its size
//! is [`bitmap_bound`] bytes: one bit per page, rounded up to whole pages.
//! Words are stored little endian.
//!
//! ## Invariant Violations
//!
//! Releasing a bit that is already clear, or a bit past the end of the map,
//! means a page id was freed twice or corrupted. Both panic.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use eyre::{ensure, Result};

use crate::config::NODE_SIZE;

/// Bytes needed to persist a bitmap of `bits` pages, rounded to whole pages.
pub fn bitmap_bound(bits: u64) -> usize {
    let words = bits.div_ceil(64) as usize;
    (words * 8).div_ceil(NODE_SIZE).max(1) * NODE_SIZE
}

/// Number of pages occupied by the persisted bitmap.
pub fn bitmap_pages(bits: u64) -> u64 {
    (bitmap_bound(bits) / NODE_SIZE) as u64
}

pub struct PageBitmap {
    words: Box<[AtomicU64]>,
    bits: u64,
    last_free_word: AtomicUsize,
}

impl PageBitmap {
    pub fn new(bits: u64) -> Self {
        let word_count = bits.div_ceil(64) as usize;
        let words: Box<[AtomicU64]> = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        let bitmap = Self {
            words,
            bits,
            last_free_word: AtomicUsize::new(0),
        };
        bitmap.set_padding();
        bitmap
    }

    /// Rebuilds a bitmap from its persisted form.
    pub fn from_bytes(bits: u64, data: &[u8]) -> Result<Self> {
        let word_count = bits.div_ceil(64) as usize;
        ensure!(
            data.len() >= word_count * 8,
            "bitmap region too small: {} bytes for {} pages",
            data.len(),
            bits
        );

        let words: Box<[AtomicU64]> = data[..word_count * 8]
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                AtomicU64::new(u64::from_le_bytes(raw))
            })
            .collect();

        let bitmap = Self {
            words,
            bits,
            last_free_word: AtomicUsize::new(0),
        };
        bitmap.set_padding();
        Ok(bitmap)
    }

    /// Serializes the bitmap into `bitmap_bound(bits)` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; bitmap_bound(self.bits)];
        for (i, word) in self.words.iter().enumerate() {
            let value = word.load(Ordering::Acquire);
            out[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn set_padding(&self) {
        let tail = self.bits % 64;
        if tail != 0 {
            if let Some(last) = self.words.last() {
                last.fetch_or(!0u64 << tail, Ordering::AcqRel);
            }
        }
    }

    /// Claims the lowest clear bit, starting the scan at the last known free
    /// word. Returns `None` when every bit is set.
    pub fn find_free_bit(&self) -> Option<u64> {
        let word_count = self.words.len();
        if word_count == 0 {
            return None;
        }

        let start = self.last_free_word.load(Ordering::Relaxed) % word_count;

        for step in 0..word_count {
            let idx = (start + step) % word_count;
            let word = &self.words[idx];
            let mut current = word.load(Ordering::Acquire);

            while current != u64::MAX {
                let bit = (!current).trailing_zeros() as u64;
                let claimed = current | (1u64 << bit);

                match word.compare_exchange_weak(
                    current,
                    claimed,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.last_free_word.store(idx, Ordering::Relaxed);
                        return Some(idx as u64 * 64 + bit);
                    }
                    Err(actual) => current = actual,
                }
            }
        }

        None
    }

    /// Clears `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range or already clear.
    pub fn release_bit(&self, index: u64) {
        assert!(
            index < self.bits,
            "bitmap release out of range: bit {} >= {}",
            index,
            self.bits
        );

        let word_idx = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let prev = self.words[word_idx].fetch_and(!mask, Ordering::AcqRel);

        assert!(prev & mask != 0, "double release of bitmap bit {}", index);

        self.last_free_word.store(word_idx, Ordering::Relaxed);
    }

    /// Sets `index` directly. Returns `false` if it was already set.
    pub fn mark_used(&self, index: u64) -> bool {
        assert!(
            index < self.bits,
            "bitmap mark out of range: bit {} >= {}",
            index,
            self.bits
        );

        let word_idx = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        let prev = self.words[word_idx].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.bits {
            return false;
        }
        let word = self.words[(index / 64) as usize].load(Ordering::Acquire);
        word & (1u64 << (index % 64)) != 0
    }

    pub fn free_count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_zeros() as u64)
            .sum()
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }
}

impl std::fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBitmap")
            .field("bits", &self.bits)
            .field("free", &self.free_count())
            .finish()
    }
}
