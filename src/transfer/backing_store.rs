//! Disk tier: one flat heap file shared by every demoted page.
//!
//! Space in the file is handed out by a [`BlockAllocator`] over byte
//! offsets. Reads and writes are positional, so operations on disjoint
//! regions only serialize on the allocator lock. On Unix the file is unlinked
//! as soon as it is open; the bytes stay valid for the life of the process
//! and disappear with it, even on a crash.
//!
//! Elsewhere the file is only removed when the store drops, so a crashed
//! process leaves its `{prefix}{n}.dat` behind. Those names are never
//! reclaimed: `create_new` skips them, and once every candidate in a
//! directory is taken that directory is passed over for the next one.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::allocator::{Allocation, BlockAllocator};
use crate::config::BackingStoreConfig;

/// How many numbered filenames to try per directory.
const MAX_CANDIDATES: usize = 16;

#[derive(Error, Debug)]
pub enum BackingStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("No backing file could be created (tried: {0})")]
    Unavailable(String),

    #[error("Backing store full: cannot place {requested} bytes")]
    Full { requested: usize },

    #[error("Buffer of {buffer} bytes does not match saved block of {block} bytes")]
    ShortBuffer { buffer: usize, block: usize },
}

#[derive(Debug, Default)]
pub struct BackingStoreStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

/// The backing file.
#[derive(Debug)]
pub struct BackingStore {
    file: File,
    path: PathBuf,
    unlinked: bool,
    allocator: Mutex<BlockAllocator>,
    stats: BackingStoreStats,
}

/// A region of the backing file holding one page's bytes.
///
/// Dropping it returns the region to the store.
#[derive(Debug)]
pub struct SavedBlock {
    store: Arc<BackingStore>,
    allocation: Allocation,
    compressed: bool,
}

impl SavedBlock {
    /// Offset of the block within the file.
    pub fn start(&self) -> usize {
        self.allocation.start()
    }

    /// Number of bytes stored.
    pub fn size(&self) -> usize {
        self.allocation.size()
    }

    /// Whether the stored bytes are the page's compressed form.
    pub fn compressed(&self) -> bool {
        self.compressed
    }

    /// The store holding this block.
    pub fn store(&self) -> &Arc<BackingStore> {
        &self.store
    }
}

impl Drop for SavedBlock {
    fn drop(&mut self) {
        let result = self.store.allocator.lock().free(self.allocation);
        debug_assert!(result.is_ok(), "saved block freed twice: {result:?}");
    }
}

impl BackingStore {
    /// Open the backing file in the configured directory, falling back to the
    /// platform temp directory.
    pub fn open(config: &BackingStoreConfig, max_size: usize) -> Result<Self, BackingStoreError> {
        let mut dirs = Vec::new();
        if let Some(dir) = config.directory.as_ref().filter(|d| !d.as_os_str().is_empty()) {
            dirs.push(dir.clone());
        }
        dirs.push(std::env::temp_dir());
        Self::open_in(&dirs, &config.prefix, max_size)
    }

    /// Try each directory in turn, and numbered candidates within each.
    pub(crate) fn open_in(
        dirs: &[PathBuf],
        prefix: &str,
        max_size: usize,
    ) -> Result<Self, BackingStoreError> {
        let mut tried = Vec::new();

        for dir in dirs {
            for index in 0..MAX_CANDIDATES {
                let path = dir.join(format!("{prefix}{index}.dat"));
                // create_new claims the name exclusively; an existing file
                // belongs to someone else.
                match OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                {
                    Ok(file) => return Ok(Self::from_file(file, path, max_size)),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Cannot create backing file");
                        break;
                    }
                }
            }
            tried.push(dir.display().to_string());
        }

        Err(BackingStoreError::Unavailable(tried.join(", ")))
    }

    fn from_file(file: File, path: PathBuf, max_size: usize) -> Self {
        let unlinked = cfg!(unix) && std::fs::remove_file(&path).is_ok();
        info!(
            path = %path.display(),
            unlinked,
            max_size,
            "Opened backing store"
        );
        Self {
            file,
            path,
            unlinked,
            allocator: Mutex::new(BlockAllocator::new(max_size)),
            stats: BackingStoreStats::default(),
        }
    }

    /// Path the backing file was created at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `data` into a freshly allocated region.
    ///
    /// On a write error the region is released again and nothing is kept.
    pub fn write_data(
        self: &Arc<Self>,
        data: &[u8],
        compressed: bool,
    ) -> Result<SavedBlock, BackingStoreError> {
        let allocation = self
            .allocator
            .lock()
            .alloc(data.len())
            .map_err(|_| BackingStoreError::Full {
                requested: data.len(),
            })?;

        let block = SavedBlock {
            store: Arc::clone(self),
            allocation,
            compressed,
        };
        // On error, dropping `block` frees the region.
        write_at(&self.file, data, allocation.start() as u64)?;

        debug!(
            offset = allocation.start(),
            size = data.len(),
            compressed,
            "Wrote block to backing store"
        );

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(block)
    }

    /// Read a saved block into `buffer`, which must be exactly its size.
    pub fn read_data(&self, buffer: &mut [u8], block: &SavedBlock) -> Result<(), BackingStoreError> {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&block.store)));
        if buffer.len() != block.size() {
            return Err(BackingStoreError::ShortBuffer {
                buffer: buffer.len(),
                block: block.size(),
            });
        }

        read_at(&self.file, buffer, block.start() as u64)?;

        debug!(
            offset = block.start(),
            size = buffer.len(),
            "Read block from backing store"
        );

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Bytes currently held in live saved blocks.
    pub fn used_bytes(&self) -> usize {
        self.allocator.lock().total_size()
    }

    /// Ceiling on bytes held.
    pub fn capacity(&self) -> usize {
        self.allocator.lock().capacity()
    }

    /// Number of live saved blocks.
    pub fn live_blocks(&self) -> usize {
        self.allocator.lock().live_blocks()
    }

    /// Get backing store I/O statistics.
    pub fn stats(&self) -> &BackingStoreStats {
        &self.stats
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        if !self.unlinked {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove backing file");
            }
        }
    }
}

#[cfg(unix)]
fn write_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(unix)]
fn read_at(file: &File, buffer: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buffer, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_at(file: &File, mut buffer: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buffer.is_empty() {
        let n = file.seek_read(buffer, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buffer = &mut std::mem::take(&mut buffer)[n..];
        offset += n as u64;
    }
    Ok(())
}
