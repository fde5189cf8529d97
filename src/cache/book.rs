//! Books: growable collections of pages that serve block allocations.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::allocator::{Allocatable, Allocation};
use crate::cache::block::{Block, Tier};
use crate::cache::page::Page;
use crate::context::Shared;
use crate::error::Result;

/// Hands out blocks, creating pages on demand and dropping them once empty.
pub struct Book {
    inner: Arc<BookInner>,
}

pub(crate) struct BookInner {
    shared: Arc<Shared>,
    page_size: usize,
    state: Mutex<BookState>,
}

struct BookState {
    pages: Vec<Arc<Page>>,
    /// Where the next search starts: the page that last satisfied one.
    next_page: usize,
}

impl Book {
    pub(crate) fn new(shared: Arc<Shared>, page_size: usize) -> Self {
        Self {
            inner: Arc::new(BookInner {
                shared,
                page_size,
                state: Mutex::new(BookState {
                    pages: Vec::new(),
                    next_page: 0,
                }),
            }),
        }
    }

    /// Default size of a new page.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Allocate `size` bytes.
    ///
    /// Only pages that are resident and not headed elsewhere are considered.
    /// When none has room a new page is created, sized to fit the request if
    /// it exceeds the default. Afterwards the resident tier is brought back
    /// under its ceiling.
    pub fn alloc(&self, size: usize) -> Result<Block> {
        let (page, allocation) = self.inner.place(size)?;
        self.inner.shared.consider_evict(Tier::Resident);
        Ok(Block::new(Arc::clone(&self.inner), page, allocation))
    }

    /// Write every page that has no up-to-date saved copy to the backing
    /// store, without evicting anything. Stops at the first failure.
    pub fn save_to_disk(&self) -> Result<()> {
        for page in self.pages() {
            page.save_to_disk()?;
        }
        Ok(())
    }

    /// Number of pages currently held.
    pub fn num_pages(&self) -> usize {
        self.inner.state.lock().pages.len()
    }

    /// Sum of live block sizes across all pages.
    pub fn count_allocated_size(&self) -> usize {
        self.pages().iter().map(|p| p.allocated_size()).sum()
    }

    /// Snapshot of the pages in allocation-search order.
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.inner.state.lock().pages.clone()
    }
}

impl BookInner {
    fn place(&self, size: usize) -> Result<(Arc<Page>, Allocation)> {
        let mut state = self.state.lock();

        let count = state.pages.len();
        for i in 0..count {
            let idx = (state.next_page + i) % count;
            let page = Arc::clone(&state.pages[idx]);
            if !page.accepts_allocations() {
                continue;
            }

            match page.allocate(size) {
                Ok(allocation) => {
                    state.next_page = idx;
                    return Ok((page, allocation));
                }
                Err(_) if page.is_empty() && page.capacity() < size => {
                    // Too small to ever satisfy this request: replace it.
                    let replacement = self.new_page(size);
                    let allocation = replacement.allocate(size)?;
                    let old = std::mem::replace(&mut state.pages[idx], Arc::clone(&replacement));
                    self.retire(&old);
                    state.next_page = idx;
                    return Ok((replacement, allocation));
                }
                Err(_) => {}
            }
        }

        let page = self.new_page(size.max(self.page_size));
        let allocation = page.allocate(size)?;
        state.pages.push(Arc::clone(&page));
        state.next_page = state.pages.len() - 1;
        Ok((page, allocation))
    }

    fn new_page(&self, size: usize) -> Arc<Page> {
        Page::new(Arc::clone(&self.shared), size)
    }

    /// Detach a page that is leaving the book from the paging queue.
    fn retire(&self, page: &Arc<Page>) {
        let mut st = page.lock();
        if st.pending_ram_class != st.ram_class {
            self.shared.coordinator.cancel(page, &mut st);
        }
        debug!(page = page.id(), "Retired page");
    }

    /// Return a block's bytes to its page; drop the page once it is empty.
    pub(crate) fn release(&self, page: &Arc<Page>, allocation: Allocation) {
        let mut state = self.state.lock();

        let outcome = match page.release(allocation) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(page = page.id(), error = %e, "Failed to release block");
                return;
            }
        };
        if !outcome.now_empty {
            return;
        }

        if let Some(idx) = state.pages.iter().position(|p| Arc::ptr_eq(p, page)) {
            let removed = state.pages.remove(idx);
            if state.next_page > idx {
                state.next_page -= 1;
            }
            if state.next_page >= state.pages.len() {
                state.next_page = 0;
            }
            self.retire(&removed);
        }
    }
}
