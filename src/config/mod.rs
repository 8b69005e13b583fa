//! # cowtree Configuration Module
//!
//! This module centralizes all configuration constants. Constants are grouped
//! by their functional area and interdependencies are documented and enforced
//! through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The node codec, the split logic and the page cache all derive their limits
//! from `NODE_SIZE`. Keeping the derived values next to each other, with
//! `const` assertions, prevents a change to one from silently breaking the
//! guarantee that a split always makes room for the pending entry.
//!
//! Runtime configuration (paths, cache capacity, queue depth) is handled by
//! [`crate::storage::StorageConfig`] and [`crate::btree::TreeBuilder`].
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
