//! Tier definitions and the block handle.
//!
//! A [`Block`] is a byte range inside one page. It is the unit callers
//! allocate and touch; pages are the unit that moves between tiers.

use std::ops::{Deref, Range};
use std::sync::Arc;

use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};

use crate::cache::allocator::Allocation;
use crate::cache::book::BookInner;
use crate::cache::page::{Page, PageId, PageState};
use crate::error::{PagingError, Result};

/// Where a page's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Tier 0: uncompressed in RAM, directly addressable.
    Resident,
    /// Tier 1: zstd-compressed in RAM.
    Compressed,
    /// Tier 2: in the backing file.
    Disk,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Resident, Tier::Compressed, Tier::Disk];

    /// Returns the numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::Resident => 0,
            Tier::Compressed => 1,
            Tier::Disk => 2,
        }
    }

    /// Returns the next slower tier, or None if already coldest.
    pub fn demote(&self) -> Option<Tier> {
        match self {
            Tier::Resident => Some(Tier::Compressed),
            Tier::Compressed => Some(Tier::Disk),
            Tier::Disk => None,
        }
    }

    /// Returns the next faster tier, or None if already hottest.
    pub fn promote(&self) -> Option<Tier> {
        match self {
            Tier::Resident => None,
            Tier::Compressed => Some(Tier::Resident),
            Tier::Disk => Some(Tier::Compressed),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Resident => write!(f, "resident"),
            Tier::Compressed => write!(f, "compressed"),
            Tier::Disk => write!(f, "disk"),
        }
    }
}

/// Snapshot of one tier's usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Number of pages in this tier.
    pub page_count: usize,
    /// Bytes charged to this tier.
    pub bytes_used: usize,
    /// Ceiling in bytes, None if unbounded.
    pub capacity: Option<usize>,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 for unbounded tiers).
    pub fn usage_fraction(&self) -> f64 {
        match self.capacity {
            Some(cap) if cap > 0 => self.bytes_used as f64 / cap as f64,
            _ => 0.0,
        }
    }

    /// Whether the tier holds more than its ceiling.
    pub fn over_capacity(&self) -> bool {
        self.capacity.is_some_and(|cap| self.bytes_used > cap)
    }
}

/// A live allocation inside a page. Dropping it returns the bytes to the page.
pub struct Block {
    book: Arc<BookInner>,
    page: Arc<Page>,
    allocation: Allocation,
}

impl Block {
    pub(crate) fn new(book: Arc<BookInner>, page: Arc<Page>, allocation: Allocation) -> Self {
        Self {
            book,
            page,
            allocation,
        }
    }

    /// Length in bytes.
    pub fn size(&self) -> usize {
        self.allocation.size()
    }

    /// Offset within the owning page.
    pub fn start(&self) -> usize {
        self.allocation.start()
    }

    pub fn page_id(&self) -> PageId {
        self.page.id()
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// Tier of the owning page.
    pub fn tier(&self) -> Tier {
        self.page.tier()
    }

    /// Tier the owning page is headed for.
    pub fn pending_tier(&self) -> Tier {
        self.page.pending_tier()
    }

    /// Access the block's bytes.
    ///
    /// With `force_resident` the page is brought resident synchronously
    /// (cancelling any queued transition) and this returns `Some`. Without
    /// it, a non-resident page is queued for restoration and this returns
    /// `None`; ask again later.
    ///
    /// The returned guard holds the page lock. Drop it before making other
    /// calls on the same book.
    pub fn get_pointer(&self, force_resident: bool) -> Result<Option<BlockData<'_>>> {
        let mut state = self.page.lock();
        if !self.page.ensure_resident(&mut state, force_resident)? {
            return Ok(None);
        }
        Ok(Some(BlockData {
            page: &self.page,
            state: Some(state),
            range: self.allocation.range(),
        }))
    }

    /// Copy `bytes` into the start of the block.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.size() {
            return Err(PagingError::OutOfBounds {
                len: bytes.len(),
                size: self.size(),
            });
        }
        if let Some(mut data) = self.get_pointer(true)? {
            data.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Copy the block's bytes out, making the page resident first.
    pub fn read(&self) -> Result<Vec<u8>> {
        Ok(self
            .get_pointer(true)?
            .map(|data| data.to_vec())
            .unwrap_or_default())
    }

    /// Ask for the owning page to move to `tier`.
    pub fn request_tier(&self, tier: Tier) -> Result<()> {
        self.page.request_tier(tier)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        self.book.release(&self.page, self.allocation);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("page", &self.page.id())
            .field("start", &self.start())
            .field("size", &self.size())
            .finish()
    }
}

/// Borrowed view of a resident block.
///
/// While it lives the page cannot change tier. Dropping it lets the resident
/// chain shed load.
pub struct BlockData<'a> {
    page: &'a Arc<Page>,
    state: Option<MutexGuard<'a, PageState>>,
    range: Range<usize>,
}

impl BlockData<'_> {
    /// Mutable access. Any saved copy on disk is discarded.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let range = self.range.clone();
        self.state
            .as_mut()
            .and_then(|st| {
                st.invalidate_saved_block();
                st.data.as_mut()
            })
            .map(|data| &mut data[range])
            .unwrap_or_default()
    }
}

impl Deref for BlockData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.state
            .as_ref()
            .and_then(|st| st.data.as_deref())
            .map(|data| &data[self.range.clone()])
            .unwrap_or_default()
    }
}

impl Drop for BlockData<'_> {
    fn drop(&mut self) {
        drop(self.state.take());
        self.page.shared().consider_evict(Tier::Resident);
    }
}
