//! # Page File
//!
//! `PageFile` is the raw block device underneath the page cache: a regular
//! file addressed in `NODE_SIZE` sectors with positional I/O.
//!
//! ## Positional I/O
//!
//! Reads and writes use `read_exact_at` / `write_all_at`, which take `&self`
//! and never move the file cursor. Any number of I/O workers can therefore
//! share one `PageFile` through an `Arc` without a lock.
//!
//! ## Direct I/O
//!
//! On Linux the file can be opened with `O_DIRECT`, bypassing the kernel page
//! cache. Every transfer is then one full page from a [`PageBuf`], which is
//! aligned to `OS_PAGE_SIZE`, at an offset that is a multiple of `NODE_SIZE`,
//! satisfying the alignment rules of direct I/O. Other platforms ignore the
//! flag.
//!
//! ## File Format
//!
//! ```text
//! Offset 0:              sector 0 (super-block)
//! Offset NODE_SIZE:      sector 1
//! Offset 2 × NODE_SIZE:  sector 2
//! ...
//! ```
//!
//! The file is sized once at creation and never grows; its length must be a
//! multiple of `NODE_SIZE`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};

use super::page::PageBuf;
use crate::config::NODE_SIZE;

#[derive(Debug)]
pub struct PageFile {
    file: File,
    path: PathBuf,
    page_count: u64,
}

impl PageFile {
    pub fn open<P: AsRef<Path>>(path: P, direct_io: bool) -> Result<Self> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        apply_direct_io(&mut options, direct_io);

        let file = options
            .open(path)
            .wrap_err_with(|| format!("failed to open tree file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty tree file '{}'",
            path.display()
        );

        ensure!(
            file_size % NODE_SIZE as u64 == 0,
            "tree file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            NODE_SIZE
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_count: file_size / NODE_SIZE as u64,
        })
    }

    /// Creates (or truncates) a file of `page_count` zeroed pages and opens it.
    pub fn create<P: AsRef<Path>>(path: P, page_count: u64, direct_io: bool) -> Result<Self> {
        let path = path.as_ref();

        ensure!(page_count > 0, "page count must be at least 1");

        {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .wrap_err_with(|| format!("failed to create tree file '{}'", path.display()))?;

            let file_size = page_count * NODE_SIZE as u64;
            file.set_len(file_size)
                .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;
            file.sync_all()
                .wrap_err_with(|| format!("failed to sync new file '{}'", path.display()))?;
        }

        Self::open(path, direct_io)
    }

    pub fn read_page(&self, sector: u64, buf: &mut PageBuf) -> Result<()> {
        ensure!(
            sector < self.page_count,
            "sector {} out of bounds (page_count={})",
            sector,
            self.page_count
        );

        self.file
            .read_exact_at(buf.as_mut_slice(), sector * NODE_SIZE as u64)
            .wrap_err_with(|| format!("failed to read sector {} of '{}'", sector, self.path.display()))
    }

    pub fn write_page(&self, sector: u64, buf: &PageBuf) -> Result<()> {
        ensure!(
            sector < self.page_count,
            "sector {} out of bounds (page_count={})",
            sector,
            self.page_count
        );

        self.file
            .write_all_at(buf.as_slice(), sector * NODE_SIZE as u64)
            .wrap_err_with(|| format!("failed to write sector {} of '{}'", sector, self.path.display()))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * NODE_SIZE as u64
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn apply_direct_io(options: &mut OpenOptions, direct_io: bool) {
    use std::os::unix::fs::OpenOptionsExt;

    if direct_io {
        options.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_direct_io(_options: &mut OpenOptions, _direct_io: bool) {}
