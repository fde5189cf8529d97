//! Pages: the unit of allocation and of tier movement.
//!
//! A page owns one contiguous buffer carved up by its own [`BlockAllocator`],
//! and is one member of the LRU registry. Its bytes live in one of three
//! forms:
//!
//! ```text
//!   Resident ──compress──▶ Compressed ──save──▶ Disk
//!      ▲  └──────────────save (compressed tier disabled)──────┘
//!      └──inflate── Compressed ◀──restore (compressed flag)── Disk
//! ```
//!
//! Every transition runs with the page's own lock held, either on the
//! background worker or inline on the requesting thread.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use crate::cache::allocator::{AllocError, Allocatable, Allocation, BlockAllocator, FreeOutcome};
use crate::cache::block::Tier;
use crate::cache::lru::{LruHandle, RecencyMember};
use crate::context::Shared;
use crate::error::PagingError;
use crate::transfer::backing_store::SavedBlock;

/// Unique identifier for a page within its context.
pub type PageId = u64;

/// Everything guarded by the page lock.
pub(crate) struct PageState {
    /// Resident: the raw bytes. Compressed: the zstd stream. Disk: none.
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) uncompressed_size: usize,
    pub(crate) ram_class: Tier,
    /// Tier the page is headed for; differs from `ram_class` while queued.
    pub(crate) pending_ram_class: Tier,
    /// Copy on disk, valid only while the bytes are unmodified.
    pub(crate) saved_block: Option<SavedBlock>,
    pub(crate) allocator: BlockAllocator,
}

impl PageState {
    /// Drop the on-disk copy because the bytes are about to change.
    pub(crate) fn invalidate_saved_block(&mut self) {
        if let Some(block) = self.saved_block.take() {
            trace!(offset = block.start(), size = block.size(), "Invalidated saved block");
        }
    }
}

/// One allocatable, evictable region of memory.
pub struct Page {
    id: PageId,
    lru: LruHandle,
    shared: Arc<Shared>,
    state: Mutex<PageState>,
}

impl Page {
    /// Create a resident, zero-filled page and enqueue it on the resident chain.
    pub(crate) fn new(shared: Arc<Shared>, size: usize) -> Arc<Self> {
        let id = shared.next_page_id();
        let page = Arc::new_cyclic(|weak: &Weak<Page>| {
            let member: Weak<dyn RecencyMember> = weak.clone();
            let lru = shared.lru.register(member, size);
            Page {
                id,
                lru,
                shared: Arc::clone(&shared),
                state: Mutex::new(PageState {
                    data: Some(vec![0u8; size]),
                    uncompressed_size: size,
                    ram_class: Tier::Resident,
                    pending_ram_class: Tier::Resident,
                    saved_block: None,
                    allocator: BlockAllocator::new(size),
                }),
            }
        });
        shared.lru.enqueue(page.lru, shared.chain(Tier::Resident));
        debug!(page = id, size, "Created page");
        page
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Current residency tier.
    pub fn tier(&self) -> Tier {
        self.state.lock().ram_class
    }

    /// Tier the page is headed for (equal to [`Page::tier`] unless queued).
    pub fn pending_tier(&self) -> Tier {
        self.state.lock().pending_ram_class
    }

    /// Bytes currently held in memory (compressed size when compressed).
    pub fn memory_size(&self) -> usize {
        self.state.lock().data.as_ref().map_or(0, Vec::len)
    }

    /// Sum of live block sizes.
    pub fn allocated_size(&self) -> usize {
        self.state.lock().allocator.total_size()
    }

    /// Whether an up-to-date copy exists in the backing store.
    pub fn has_saved_block(&self) -> bool {
        self.state.lock().saved_block.is_some()
    }

    pub(crate) fn lru_handle(&self) -> LruHandle {
        self.lru
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// Resident, and not headed anywhere else.
    pub(crate) fn accepts_allocations(&self) -> bool {
        let st = self.state.lock();
        st.ram_class == Tier::Resident && st.pending_ram_class == Tier::Resident
    }

    /// Ask for the page to move to `tier`, then let the destination chain
    /// shed load once the page lock is released.
    pub fn request_tier(self: &Arc<Self>, tier: Tier) -> Result<(), PagingError> {
        let (result, landed) = {
            let mut st = self.state.lock();
            let result = self.request_ram_class(&mut st, tier);
            (result, st.ram_class)
        };
        if landed == tier {
            self.shared.consider_evict(landed);
        }
        result
    }

    /// Write the bytes to the backing store without evicting them, so a later
    /// eviction is a pure free.
    pub fn save_to_disk(&self) -> Result<(), PagingError> {
        let mut st = self.state.lock();
        self.do_save_to_disk(&mut st)
    }

    /// Hand the transition to the background worker, or run it here if no
    /// worker is running.
    pub(crate) fn request_ram_class(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, PageState>,
        tier: Tier,
    ) -> Result<(), PagingError> {
        if self.shared.coordinator.request(self, st, tier) {
            return Ok(());
        }

        let result = self.apply(st, tier);
        st.pending_ram_class = st.ram_class;
        result
    }

    /// Bypass the queue and make the page resident right now.
    pub(crate) fn make_resident_now(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, PageState>,
    ) -> Result<(), PagingError> {
        if st.pending_ram_class != st.ram_class {
            self.shared.coordinator.cancel(self, st);
        }

        let result = self.make_resident(st);
        st.pending_ram_class = st.ram_class;
        result
    }

    /// Make sure the bytes are (or will be) resident. Returns whether they are
    /// resident now.
    pub(crate) fn ensure_resident(
        self: &Arc<Self>,
        st: &mut MutexGuard<'_, PageState>,
        force: bool,
    ) -> Result<bool, PagingError> {
        if st.ram_class != Tier::Resident || st.pending_ram_class != Tier::Resident {
            if force {
                self.make_resident_now(st)?;
            } else {
                self.request_ram_class(st, Tier::Resident)?;
            }
        }

        if st.ram_class == Tier::Resident {
            self.mark_used(st);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Entry point for the background worker. Returns the tier the page
    /// landed in if the transition succeeded; that tier may now be over
    /// budget.
    pub(crate) fn service(&self, target: Tier) -> Option<Tier> {
        let mut st = self.state.lock();
        if let Err(e) = self.apply(&mut st, target) {
            error!(page = self.id, target = %target, error = %e, "Background transition failed");
        }
        st.pending_ram_class = st.ram_class;
        if st.ram_class != target {
            self.mark_used(&st);
            return None;
        }
        Some(target)
    }

    fn apply(&self, st: &mut PageState, target: Tier) -> Result<(), PagingError> {
        match target {
            Tier::Resident => self.make_resident(st),
            Tier::Compressed => self.make_compressed(st),
            Tier::Disk => self.make_disk(st),
        }
    }

    fn mark_used(&self, st: &PageState) {
        self.shared
            .lru
            .mark_used(self.lru, self.shared.chain(st.ram_class));
    }

    fn set_ram_class(&self, st: &mut PageState, tier: Tier) {
        st.ram_class = tier;
        self.mark_used(st);
    }

    fn make_resident(&self, st: &mut PageState) -> Result<(), PagingError> {
        if st.ram_class == Tier::Resident {
            self.mark_used(st);
            return Ok(());
        }

        if st.ram_class == Tier::Disk {
            self.restore_from_disk(st)?;
        }

        if st.ram_class == Tier::Compressed {
            let compressed = st.data.as_deref().unwrap_or(&[]);
            let data = self
                .shared
                .compressor
                .decompress(compressed, st.uncompressed_size)?;
            debug!(
                page = self.id,
                from = compressed.len(),
                to = data.len(),
                "Expanded page"
            );

            st.data = Some(data);
            self.shared.lru.set_weight(self.lru, st.uncompressed_size);
            self.set_ram_class(st, Tier::Resident);
        }
        Ok(())
    }

    fn make_compressed(&self, st: &mut PageState) -> Result<(), PagingError> {
        if st.ram_class == Tier::Compressed {
            self.mark_used(st);
            return Ok(());
        }

        if st.ram_class == Tier::Disk {
            self.restore_from_disk(st)?;
        }

        if st.ram_class == Tier::Resident {
            let data = st.data.as_deref().unwrap_or(&[]);
            debug_assert_eq!(data.len(), st.uncompressed_size);
            let compressed = self.shared.compressor.compress(data)?;
            debug!(
                page = self.id,
                from = st.uncompressed_size,
                to = compressed.len(),
                "Compressed page"
            );

            self.shared.lru.set_weight(self.lru, compressed.len());
            st.data = Some(compressed);
            self.set_ram_class(st, Tier::Compressed);
        }
        Ok(())
    }

    /// Save failures are not errors for the caller: the page stays where it
    /// is and counts as freshly used.
    fn make_disk(&self, st: &mut PageState) -> Result<(), PagingError> {
        if st.ram_class == Tier::Disk {
            self.mark_used(st);
            return Ok(());
        }

        if let Err(e) = self.do_save_to_disk(st) {
            warn!(page = self.id, error = %e, "Couldn't save page to disk");
            st.pending_ram_class = st.ram_class;
            self.mark_used(st);
            return Ok(());
        }

        let saved_size = st.saved_block.as_ref().map_or(0, SavedBlock::size);
        st.data = None;
        self.shared.lru.set_weight(self.lru, saved_size);
        self.set_ram_class(st, Tier::Disk);
        Ok(())
    }

    fn do_save_to_disk(&self, st: &mut PageState) -> Result<(), PagingError> {
        if st.ram_class == Tier::Disk {
            return Ok(());
        }

        if st.saved_block.is_some() {
            debug!(page = self.id, "Page already stored");
            return Ok(());
        }

        let store = self
            .shared
            .backing_store()
            .ok_or(PagingError::DiskTierDisabled)?;
        let data = st.data.as_deref().unwrap_or(&[]);
        let compressed = st.ram_class == Tier::Compressed;
        debug!(page = self.id, size = data.len(), compressed, "Storing page to disk");

        st.saved_block = Some(store.write_data(data, compressed)?);
        Ok(())
    }

    /// Read the saved bytes back, landing in Compressed or Resident according
    /// to how they were stored.
    fn restore_from_disk(&self, st: &mut PageState) -> Result<(), PagingError> {
        if st.ram_class != Tier::Disk {
            return Ok(());
        }
        debug_assert!(st.data.is_none());

        let saved = st
            .saved_block
            .as_ref()
            .ok_or(PagingError::MissingSavedBlock(self.id))?;
        let mut buffer = vec![0u8; saved.size()];
        saved
            .store()
            .read_data(&mut buffer, saved)
            .map_err(|source| PagingError::CannotMakeResident {
                page: self.id,
                source,
            })?;
        debug!(page = self.id, size = buffer.len(), "Restored page from disk");

        let tier = if saved.compressed() {
            Tier::Compressed
        } else {
            Tier::Resident
        };
        self.shared.lru.set_weight(self.lru, buffer.len());
        st.data = Some(buffer);
        self.set_ram_class(st, tier);
        Ok(())
    }
}

impl RecencyMember for Page {
    /// Step one rung down the ladder. Pages already on disk stay put.
    fn evict_lru(self: Arc<Self>) {
        let landed = {
            let mut st = self.state.lock();
            if st.pending_ram_class != st.ram_class {
                // Already queued; it left this chain in the meantime.
                return;
            }
            let target = match st.ram_class.demote() {
                Some(Tier::Compressed) if !self.shared.compressed_enabled() => Tier::Disk,
                Some(next) => next,
                None => {
                    warn!(
                        page = self.id,
                        "Internal error: attempt to evict page already on disk"
                    );
                    return;
                }
            };

            if target == Tier::Disk && self.shared.backing_store().is_none() {
                warn!(
                    page = self.id,
                    tier = %st.ram_class,
                    "Disk tier unavailable, keeping page"
                );
                self.mark_used(&st);
                return;
            }

            if let Err(e) = self.request_ram_class(&mut st, target) {
                error!(page = self.id, target = %target, error = %e, "Eviction failed");
            }
            st.ram_class
        };

        // Inline compression may have pushed the compressed chain over budget.
        if landed == Tier::Compressed {
            self.shared.consider_evict(Tier::Compressed);
        }
    }
}

impl Allocatable for Page {
    fn allocate(&self, size: usize) -> Result<Allocation, AllocError> {
        let mut st = self.state.lock();
        let allocation = st.allocator.alloc(size)?;
        if st.ram_class != Tier::Disk {
            // The on-disk copy no longer matches.
            st.invalidate_saved_block();
        }
        Ok(allocation)
    }

    fn release(&self, allocation: Allocation) -> Result<FreeOutcome, AllocError> {
        self.state.lock().allocator.free(allocation)
    }

    fn is_empty(&self) -> bool {
        self.state.lock().allocator.is_empty()
    }

    fn capacity(&self) -> usize {
        self.state.lock().allocator.capacity()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.shared.lru.unregister(self.lru);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("id", &self.id).finish_non_exhaustive()
    }
}
