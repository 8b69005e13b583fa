//! # Key Ordering and Descent Breadcrumbs
//!
//! The tree never interprets key bytes itself. Every comparison goes through
//! a caller-supplied [`BpTreeSearch`], so the same engine serves byte-string
//! keys, big-endian integers or any encoding whose order the caller defines.
//! Whatever the comparator calls equal is a duplicate; the engine keeps
//! duplicates and does not decide uniqueness.
//!
//! ## Comparators
//!
//! - [`Lexicographic`]: plain byte order (`memcmp`, shorter prefix first)
//! - any `Fn(&[u8], &[u8]) -> Ordering` closure
//!
//! The first argument is the key stored in the node, the second the key being
//! searched for. A comparator must be a total order and must stay the same
//! for the life of a tree file.
//!
//! ## Breadcrumbs
//!
//! A descent records one `(node_id, key_index)` step per level in a
//! [`BpTreeSearchResult`]:
//!
//! ```text
//! level 0   root      node 12  key_index 1  ── child slot taken
//! level 1   internal  node 40  key_index 0
//! level 2   leaf      node 57  key_index 3  ── entry position in the leaf
//! ```
//!
//! Split and merge propagation walk this trail upward instead of searching
//! the tree again. The trail holds at most `MAX_LEVELS` steps; the first
//! `INLINE_LEVELS` live on the stack.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::config::{INLINE_LEVELS, MAX_LEVELS};

/// Caller-defined key order.
pub trait BpTreeSearch {
    /// Compares a stored key against the key being searched for.
    fn compare(&self, entry_key: &[u8], key: &[u8]) -> Ordering;
}

/// Byte-wise lexicographic order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lexicographic;

impl BpTreeSearch for Lexicographic {
    fn compare(&self, entry_key: &[u8], key: &[u8]) -> Ordering {
        entry_key.cmp(key)
    }
}

impl<F> BpTreeSearch for F
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    fn compare(&self, entry_key: &[u8], key: &[u8]) -> Ordering {
        self(entry_key, key)
    }
}

/// One level of a descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    pub node_id: u64,
    pub key_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BpTreeSearchResult {
    parent_index: SmallVec<[PathStep; INLINE_LEVELS]>,
}

impl BpTreeSearchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node_id: u64, key_index: usize) -> Result<()> {
        ensure!(
            self.parent_index.len() < MAX_LEVELS,
            "tree deeper than {} levels",
            MAX_LEVELS
        );
        self.parent_index.push(PathStep { node_id, key_index });
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.parent_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_index.is_empty()
    }

    pub fn steps(&self) -> &[PathStep] {
        &self.parent_index
    }

    pub fn get(&self, level: usize) -> Option<PathStep> {
        self.parent_index.get(level).copied()
    }

    /// The deepest step; for a completed descent, the leaf.
    pub fn leaf(&self) -> Option<PathStep> {
        self.parent_index.last().copied()
    }

    pub fn set_node_id(&mut self, level: usize, node_id: u64) {
        if let Some(step) = self.parent_index.get_mut(level) {
            step.node_id = node_id;
        }
    }

    pub fn set_key_index(&mut self, level: usize, key_index: usize) {
        if let Some(step) = self.parent_index.get_mut(level) {
            step.key_index = key_index;
        }
    }

    pub fn truncate(&mut self, depth: usize) {
        self.parent_index.truncate(depth);
    }

    pub fn clear(&mut self) {
        self.parent_index.clear();
    }
}
