//! # LRU Page Cache
//!
//! This module implements the page cache that sits between the B+tree and
//! the I/O queue: a fixed pool of entries, a hash-chained index from sector
//! to entry, and a doubly linked LRU list, all addressed by `u32` indices
//! into one entry arena.
//!
//! ## Memory Layout
//!
//! ```text
//! buckets (2 × capacity)          entries (capacity)
//! +-----+                         +--------------------------------------+
//! |  3  |──────────────────────>  | [3] sector=17 next_chain=NIL         |
//! | NIL |                         |     prev_lru / next_lru  pins  buf   |
//! |  0  |──> [0] ──next_chain──>  | [0] sector=42 next_chain=5  ...      |
//! | ... |                         | ...                                  |
//! +-----+                         +--------------------------------------+
//!
//! LRU list:  head (MRU) <──> ... <──> tail (LRU)
//! ```
//!
//! The bucket for a sector is `(sector × HASH_CONSTANT) mod buckets`. A hit
//! walks one chain comparing sector numbers and moves the entry to the head
//! of the LRU list.
//!
//! ## The Free Chain
//!
//! At construction every entry is linked into the LRU list with the sector
//! sentinel [`EMPTY_SECTOR`]. Empty entries always sit at the tail (new ones
//! start there, invalidated ones are moved back there), so claiming a slot
//! is the same operation whether or not the cache is full: take the tail.
//!
//! ## Eviction
//!
//! Strict LRU. Only the tail entry is ever considered, and only if it is not
//! pinned by an in-flight write. When the tail is pinned the page being
//! installed is handed back to the caller uncached.
//!
//! ## Buffer Pool
//!
//! `capacity` page buffers are allocated up front. A buffer whose last
//! reference is the cache (no reader still holds the `Arc`) goes back to the
//! pool on eviction or invalidation and is reused by the next read.
//!
//! ## Thread Safety
//!
//! `PageCache` is not synchronized. The storage engine wraps it in a single
//! `parking_lot::Mutex` shared by the load path, prefetch completions and
//! write-batch completions; the LRU link updates are not atomic and must
//! never interleave.

use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use tracing::trace;

use super::page::PageBuf;
use crate::config::{EMPTY_SECTOR, HASH_CONSTANT, NIL};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct LruEntry {
    sector: u64,
    next_chain: u32,
    prev_lru: u32,
    next_lru: u32,
    pins: u32,
    buf: Option<Arc<PageBuf>>,
}

pub struct PageCache {
    entries: Vec<LruEntry>,
    buckets: Vec<u32>,
    head: u32,
    tail: u32,
    pool: Vec<Arc<PageBuf>>,
    resident: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "cache capacity must be at least 1");
        ensure!(
            capacity < NIL as usize / 2,
            "cache capacity {} exceeds index range",
            capacity
        );

        let mut pool = Vec::new();
        pool.try_reserve_exact(capacity)
            .map_err(|e| eyre!("cache allocation failed for {} buffers: {}", capacity, e))?;
        for _ in 0..capacity {
            pool.push(Arc::new(PageBuf::zeroed()));
        }

        let last = capacity as u32 - 1;
        let entries = (0..capacity as u32)
            .map(|i| LruEntry {
                sector: EMPTY_SECTOR,
                next_chain: NIL,
                prev_lru: if i == 0 { NIL } else { i - 1 },
                next_lru: if i == last { NIL } else { i + 1 },
                pins: 0,
                buf: None,
            })
            .collect();

        Ok(Self {
            entries,
            buckets: vec![NIL; capacity * 2],
            head: 0,
            tail: last,
            pool,
            resident: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    fn bucket_of(&self, sector: u64) -> usize {
        (sector.wrapping_mul(HASH_CONSTANT) % self.buckets.len() as u64) as usize
    }

    fn find(&self, sector: u64) -> Option<u32> {
        let mut idx = self.buckets[self.bucket_of(sector)];
        while idx != NIL {
            let entry = &self.entries[idx as usize];
            if entry.sector == sector {
                return Some(idx);
            }
            idx = entry.next_chain;
        }
        None
    }

    fn chain_insert(&mut self, idx: u32) {
        let bucket = self.bucket_of(self.entries[idx as usize].sector);
        self.entries[idx as usize].next_chain = self.buckets[bucket];
        self.buckets[bucket] = idx;
    }

    fn chain_remove(&mut self, idx: u32) {
        let bucket = self.bucket_of(self.entries[idx as usize].sector);
        let next = self.entries[idx as usize].next_chain;

        if self.buckets[bucket] == idx {
            self.buckets[bucket] = next;
        } else {
            let mut cur = self.buckets[bucket];
            while cur != NIL {
                let following = self.entries[cur as usize].next_chain;
                if following == idx {
                    self.entries[cur as usize].next_chain = next;
                    break;
                }
                cur = following;
            }
        }
        self.entries[idx as usize].next_chain = NIL;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let e = &self.entries[idx as usize];
            (e.prev_lru, e.next_lru)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.entries[prev as usize].next_lru = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.entries[next as usize].prev_lru = prev;
        }

        let e = &mut self.entries[idx as usize];
        e.prev_lru = NIL;
        e.next_lru = NIL;
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let e = &mut self.entries[idx as usize];
            e.prev_lru = NIL;
            e.next_lru = old_head;
        }
        if old_head == NIL {
            self.tail = idx;
        } else {
            self.entries[old_head as usize].prev_lru = idx;
        }
        self.head = idx;
    }

    fn push_back(&mut self, idx: u32) {
        let old_tail = self.tail;
        {
            let e = &mut self.entries[idx as usize];
            e.next_lru = NIL;
            e.prev_lru = old_tail;
        }
        if old_tail == NIL {
            self.head = idx;
        } else {
            self.entries[old_tail as usize].next_lru = idx;
        }
        self.tail = idx;
    }

    fn promote(&mut self, idx: u32) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Looks a sector up, promoting it to most-recently-used on a hit.
    pub fn lookup(&mut self, sector: u64) -> Option<Arc<PageBuf>> {
        match self.find(sector) {
            Some(idx) => {
                self.hits += 1;
                self.promote(idx);
                self.entries[idx as usize].buf.clone()
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, sector: u64) -> bool {
        self.find(sector).is_some()
    }

    /// Hands out a buffer for an incoming read or write, reusing a pooled
    /// one when available.
    pub fn take_buffer(&mut self) -> Arc<PageBuf> {
        self.pool
            .pop()
            .unwrap_or_else(|| Arc::new(PageBuf::zeroed()))
    }

    /// Returns a buffer to the pool if nothing else references it.
    pub fn recycle(&mut self, mut buf: Arc<PageBuf>) {
        if Arc::get_mut(&mut buf).is_some() && self.pool.len() < self.entries.len() {
            self.pool.push(buf);
        }
    }

    /// Installs a freshly read page. If the sector is already cached the
    /// resident copy wins and is returned; otherwise the tail slot is
    /// claimed, evicting its page when it is unpinned.
    pub fn install(&mut self, sector: u64, buf: Arc<PageBuf>) -> Arc<PageBuf> {
        if let Some(idx) = self.find(sector) {
            self.promote(idx);
            if let Some(resident) = self.entries[idx as usize].buf.clone() {
                self.recycle(buf);
                return resident;
            }
        }

        self.insert_new(sector, buf)
    }

    /// Installs the bytes just written for `sector`, replacing any resident
    /// copy.
    pub fn replace(&mut self, sector: u64, buf: Arc<PageBuf>) {
        match self.find(sector) {
            Some(idx) => {
                let old = self.entries[idx as usize].buf.replace(buf);
                if let Some(old) = old {
                    self.recycle(old);
                }
                self.promote(idx);
            }
            None => {
                self.insert_new(sector, buf);
            }
        }
    }

    fn insert_new(&mut self, sector: u64, buf: Arc<PageBuf>) -> Arc<PageBuf> {
        let idx = self.tail;
        if idx == NIL {
            return buf;
        }

        let victim = self.entries[idx as usize].sector;
        if victim != EMPTY_SECTOR {
            if self.entries[idx as usize].pins > 0 {
                trace!(sector, victim, "LRU tail pinned, page left uncached");
                return buf;
            }

            self.chain_remove(idx);
            if let Some(old) = self.entries[idx as usize].buf.take() {
                self.recycle(old);
            }
            self.resident -= 1;
            self.evictions += 1;
            trace!(sector = victim, "evicted page");
        }

        {
            let e = &mut self.entries[idx as usize];
            e.sector = sector;
            e.pins = 0;
            e.buf = Some(Arc::clone(&buf));
        }
        self.chain_insert(idx);
        self.promote(idx);
        self.resident += 1;

        buf
    }

    /// Drops a cached sector and returns its slot to the free chain.
    pub fn invalidate(&mut self, sector: u64) -> bool {
        let Some(idx) = self.find(sector) else {
            return false;
        };

        self.chain_remove(idx);
        let old = {
            let e = &mut self.entries[idx as usize];
            e.sector = EMPTY_SECTOR;
            e.pins = 0;
            e.buf.take()
        };
        if let Some(old) = old {
            self.recycle(old);
        }
        self.unlink(idx);
        self.push_back(idx);
        self.resident -= 1;
        true
    }

    /// Pins a cached sector against eviction. Returns `false` if the sector
    /// is not cached.
    pub fn pin(&mut self, sector: u64) -> bool {
        match self.find(sector) {
            Some(idx) => {
                self.entries[idx as usize].pins += 1;
                self.promote(idx);
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, sector: u64) {
        if let Some(idx) = self.find(sector) {
            let e = &mut self.entries[idx as usize];
            e.pins = e.pins.saturating_sub(1);
        }
    }

    pub fn is_pinned(&self, sector: u64) -> bool {
        self.find(sector)
            .map(|idx| self.entries[idx as usize].pins > 0)
            .unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn resident(&self) -> usize {
        self.resident
    }

    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.entries.len(),
            resident: self.resident,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Arc<PageBuf> {
        let mut p = PageBuf::zeroed();
        p[0] = byte;
        Arc::new(p)
    }

    #[test]
    fn new_cache_is_empty_with_full_pool() {
        let cache = PageCache::new(8).unwrap();

        assert_eq!(cache.capacity(), 8);
        assert_eq!(cache.resident(), 0);
        assert_eq!(cache.pooled(), 8);
        assert!(!cache.contains(0));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(PageCache::new(0).is_err());
    }

    #[test]
    fn install_then_lookup_hits() {
        let mut cache = PageCache::new(4).unwrap();
        cache.install(10, page(0xAA));

        let hit = cache.lookup(10).unwrap();

        assert_eq!(hit[0], 0xAA);
        assert_eq!(cache.stats().hits, 1);
        assert!(cache.lookup(11).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn full_cache_evicts_least_recently_used() {
        let mut cache = PageCache::new(3).unwrap();
        cache.install(1, page(1));
        cache.install(2, page(2));
        cache.install(3, page(3));

        cache.install(4, page(4));

        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lookup_hit_protects_entry_from_eviction() {
        let mut cache = PageCache::new(3).unwrap();
        cache.install(1, page(1));
        cache.install(2, page(2));
        cache.install(3, page(3));

        cache.lookup(1);
        cache.install(4, page(4));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn pinned_tail_is_not_evicted() {
        let mut cache = PageCache::new(2).unwrap();
        cache.install(1, page(1));
        cache.pin(1);
        cache.install(2, page(2));

        let returned = cache.install(3, page(3));

        assert_eq!(returned[0], 3);
        assert!(cache.contains(1));
        assert!(cache.contains(2));
        assert!(!cache.contains(3));

        cache.unpin(1);
        cache.install(3, page(3));
        assert!(!cache.contains(1));
        assert!(cache.contains(3));
    }

    #[test]
    fn install_keeps_resident_copy() {
        let mut cache = PageCache::new(2).unwrap();
        let first = cache.install(5, page(1));
        let second = cache.install(5, page(2));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second[0], 1);
    }

    #[test]
    fn replace_overwrites_resident_copy() {
        let mut cache = PageCache::new(2).unwrap();
        cache.install(5, page(1));
        cache.replace(5, page(2));

        assert_eq!(cache.lookup(5).unwrap()[0], 2);
        assert_eq!(cache.resident(), 1);
    }

    #[test]
    fn invalidate_frees_slot_for_reuse() {
        let mut cache = PageCache::new(2).unwrap();
        cache.install(1, page(1));
        cache.install(2, page(2));

        assert!(cache.invalidate(2));
        assert!(!cache.invalidate(2));
        cache.install(3, page(3));

        assert!(cache.contains(1));
        assert!(cache.contains(3));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn evicted_unshared_buffer_returns_to_pool() {
        let mut cache = PageCache::new(1).unwrap();
        let buf = cache.take_buffer();
        let ptr = Arc::as_ptr(&buf);
        cache.install(1, buf);

        cache.install(2, page(2));
        let reused = cache.take_buffer();

        assert_eq!(Arc::as_ptr(&reused), ptr);
    }

    #[test]
    fn evicted_shared_buffer_is_not_reused() {
        let mut cache = PageCache::new(1).unwrap();
        let _ = cache.take_buffer();
        let held = cache.install(1, page(1));

        cache.install(2, page(2));
        let fresh = cache.take_buffer();

        assert!(!Arc::ptr_eq(&held, &fresh));
        assert_eq!(held[0], 1);
    }

    #[test]
    fn colliding_sectors_share_a_chain() {
        let mut cache = PageCache::new(4).unwrap();
        let sectors = [0u64, 8, 16, 24];
        for &s in &sectors {
            cache.install(s, page(s as u8));
        }

        for &s in &sectors {
            assert_eq!(cache.lookup(s).unwrap()[0], s as u8);
        }

        cache.invalidate(8);
        assert!(cache.contains(0));
        assert!(!cache.contains(8));
        assert!(cache.contains(16));
        assert!(cache.contains(24));
    }
}
