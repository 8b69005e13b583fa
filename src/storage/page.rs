//! # Page Buffers and Page Types
//!
//! Every unit of I/O in cowtree is a `NODE_SIZE` (16KB) page. In memory a page
//! lives in a [`PageBuf`], a plain byte array whose alignment matches the OS
//! page size so the same buffer can be handed to `O_DIRECT` reads and writes
//! without a bounce copy.
//!
//! ## Sharing
//!
//! Pages move between the I/O workers, the page cache and tree readers as
//! `Arc<PageBuf>`. A buffer is only ever written while it is uniquely owned
//! (an I/O read filling it, or a write batch copying bytes into it), which is
//! checked with `Arc::get_mut`. Once published to the cache it is immutable.
//!
//! ```text
//! I/O worker ──(unique Arc, filled)──> PageCache ──(clone)──> reader
//!                                         │
//!                      evicted, unique ───┘──> buffer pool (reused)
//! ```
//!
//! ## Page Types
//!
//! The first byte of a tree node identifies its kind:
//!
//! - **Internal** (0x01): keys and child page ids
//! - **Leaf** (0x02): keys and inline or overflow values
//!
//! The super-block and bitmap pages have fixed positions and carry no type
//! byte of their own.

use std::ops::{Deref, DerefMut};

use eyre::{ensure, Result};

use crate::config::{NODE_SIZE, OS_PAGE_SIZE};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Internal = 0x01,
    Leaf = 0x02,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Internal,
            0x02 => PageType::Leaf,
            _ => PageType::Unknown,
        }
    }
}

/// One page worth of bytes, aligned for direct I/O.
#[repr(C, align(4096))]
pub struct PageBuf([u8; NODE_SIZE]);

const _: () = assert!(
    std::mem::align_of::<PageBuf>() == OS_PAGE_SIZE,
    "PageBuf alignment must match OS_PAGE_SIZE"
);

impl PageBuf {
    pub fn zeroed() -> Self {
        Self([0u8; NODE_SIZE])
    }

    pub fn boxed() -> Box<Self> {
        Box::new(Self::zeroed())
    }

    /// Copies a full page image into the buffer.
    pub fn copy_from_page(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == NODE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            NODE_SIZE
        );
        self.0.copy_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl Clone for PageBuf {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl Deref for PageBuf {
    type Target = [u8; NODE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf")
            .field("page_type", &PageType::from_byte(self.0[0]))
            .finish_non_exhaustive()
    }
}
