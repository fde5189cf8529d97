//! Crate-level error type.

use thiserror::Error;

use crate::cache::allocator::AllocError;
use crate::cache::compressor::CompressionError;
use crate::cache::page::PageId;
use crate::transfer::backing_store::BackingStoreError;

#[derive(Error, Debug)]
pub enum PagingError {
    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocError),

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Backing store error: {0}")]
    BackingStore(#[from] BackingStoreError),

    #[error("Disk tier disabled: no backing store could be opened")]
    DiskTierDisabled,

    #[error("Cannot make page {page} resident: {source}")]
    CannotMakeResident {
        page: PageId,
        #[source]
        source: BackingStoreError,
    },

    #[error("Page {0} is on disk but has no saved copy")]
    MissingSavedBlock(PageId),

    #[error("Write of {len} bytes exceeds block of {size} bytes")]
    OutOfBounds { len: usize, size: usize },
}

pub type Result<T> = std::result::Result<T, PagingError>;
