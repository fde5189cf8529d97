//! Background paging worker.
//!
//! Tier transitions requested while the worker runs are queued here instead
//! of running on the caller's thread. Restores to resident ("reads") always
//! go ahead of demotions ("writes"). A page sits in at most one queue at a
//! time; while queued it is parked on the neutral pending LRU chain so it is
//! not chosen for eviction twice.
//!
//! Lock order: a page lock may be held when taking the queue lock, never
//! the reverse. A caller that must wait for the worker to finish with its
//! page drops both locks while waiting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::cache::block::Tier;
use crate::cache::page::{Page, PageId, PageState};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub total_requested: u64,
    pub total_completed: u64,
    pub total_cancelled: u64,
}

#[derive(Default)]
struct QueueState {
    pending_reads: VecDeque<(Arc<Page>, Tier)>,
    pending_writes: VecDeque<(Arc<Page>, Tier)>,
    /// Page the worker is transitioning right now.
    working_page: Option<PageId>,
    /// Worker is running the follow-up eviction for the last page.
    evicting: bool,
    running: bool,
    shutdown: bool,
    stats: CoordinatorStats,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending_reads.is_empty()
            && self.pending_writes.is_empty()
            && self.working_page.is_none()
            && !self.evicting
    }
}

/// Owns the worker thread and its queues.
pub struct PagingCoordinator {
    queues: Mutex<QueueState>,
    /// Signalled when work is queued or shutdown is requested.
    pending_cvar: Condvar,
    /// Signalled each time the worker finishes a page.
    working_cvar: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for PagingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PagingCoordinator {
    /// A coordinator with no worker; requests run inline until started.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(QueueState::default()),
            pending_cvar: Condvar::new(),
            working_cvar: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread. No-op if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        {
            let mut q = self.queues.lock();
            q.shutdown = false;
            q.running = true;
        }

        let coordinator = Arc::clone(self);
        match thread::Builder::new()
            .name("page-worker".to_string())
            .spawn(move || coordinator.worker_loop())
        {
            Ok(handle) => {
                info!("Started background paging worker");
                *worker = Some(handle);
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn paging worker, transitions will run inline");
                self.queues.lock().running = false;
            }
        }
    }

    /// Let the worker drain every queued request, then join it.
    ///
    /// Must not be called while holding a page lock.
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        {
            let mut q = self.queues.lock();
            info!(
                reads = q.pending_reads.len(),
                writes = q.pending_writes.len(),
                "Stopping background paging worker"
            );
            q.shutdown = true;
            self.pending_cvar.notify_all();
        }

        if handle.join().is_err() {
            error!("Paging worker panicked");
        }

        let mut q = self.queues.lock();
        debug_assert!(q.pending_reads.is_empty() && q.pending_writes.is_empty());
        q.running = false;
        q.shutdown = false;
        self.working_cvar.notify_all();
    }

    pub fn is_running(&self) -> bool {
        let q = self.queues.lock();
        q.running && !q.shutdown
    }

    /// Block until both queues are empty and the worker is between pages.
    pub fn wait_idle(&self) {
        let mut q = self.queues.lock();
        while q.running && !q.is_idle() {
            self.working_cvar.wait(&mut q);
        }
    }

    /// Number of queued restores.
    pub fn pending_reads(&self) -> usize {
        self.queues.lock().pending_reads.len()
    }

    /// Number of queued demotions.
    pub fn pending_writes(&self) -> usize {
        self.queues.lock().pending_writes.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.queues.lock().stats.clone()
    }

    /// Queue `page` to move to `target`, replacing any different request
    /// already queued for it.
    ///
    /// Returns false if no worker is running; the caller then performs the
    /// transition itself.
    pub(crate) fn request(
        &self,
        page: &Arc<Page>,
        st: &mut MutexGuard<'_, PageState>,
        target: Tier,
    ) -> bool {
        let mut q = self.queues.lock();
        loop {
            if !q.running || q.shutdown {
                return false;
            }
            if st.pending_ram_class == target {
                return true;
            }
            if st.pending_ram_class == st.ram_class {
                break;
            }
            if q.working_page == Some(page.id()) {
                q = self.wait_for_worker(page.id(), st, q);
                continue;
            }
            self.dequeue(page, st, &mut q);
            if st.pending_ram_class == target {
                // Withdrawing the request was enough.
                return true;
            }
            break;
        }

        let shared = page.shared();
        shared.lru.mark_used(page.lru_handle(), shared.chains.pending);
        st.pending_ram_class = target;
        if target == Tier::Resident {
            q.pending_reads.push_back((Arc::clone(page), target));
        } else {
            q.pending_writes.push_back((Arc::clone(page), target));
        }
        q.stats.total_requested += 1;
        debug!(page = page.id(), from = %st.ram_class, to = %target, "Queued page transition");
        self.pending_cvar.notify_one();
        true
    }

    /// Withdraw whatever request is outstanding for `page`. If the worker is
    /// already working on it, wait for it to finish instead.
    pub(crate) fn cancel(&self, page: &Arc<Page>, st: &mut MutexGuard<'_, PageState>) {
        let mut q = self.queues.lock();
        loop {
            if st.pending_ram_class == st.ram_class {
                return;
            }
            if q.working_page == Some(page.id()) {
                q = self.wait_for_worker(page.id(), st, q);
                continue;
            }
            self.dequeue(page, st, &mut q);
            return;
        }
    }

    /// Release the page lock and the queue lock until the worker moves off
    /// `id`, then retake both, page first.
    fn wait_for_worker<'q>(
        &'q self,
        id: PageId,
        st: &mut MutexGuard<'_, PageState>,
        q: MutexGuard<'q, QueueState>,
    ) -> MutexGuard<'q, QueueState> {
        MutexGuard::unlocked(st, move || {
            let mut q = q;
            while q.working_page == Some(id) {
                self.working_cvar.wait(&mut q);
            }
        });
        self.queues.lock()
    }

    fn dequeue(&self, page: &Arc<Page>, st: &mut PageState, q: &mut QueueState) {
        let queue = if st.pending_ram_class == Tier::Resident {
            &mut q.pending_reads
        } else {
            &mut q.pending_writes
        };
        match queue.iter().position(|(p, _)| Arc::ptr_eq(p, page)) {
            Some(pos) => {
                queue.remove(pos);
                q.stats.total_cancelled += 1;
            }
            None => debug_assert!(false, "page {} pending but not queued", page.id()),
        }

        let shared = page.shared();
        shared
            .lru
            .mark_used(page.lru_handle(), shared.chain(st.ram_class));
        debug!(page = page.id(), dropped = %st.pending_ram_class, "Cancelled page transition");
        st.pending_ram_class = st.ram_class;
    }

    fn worker_loop(&self) {
        let mut q = self.queues.lock();
        loop {
            while q.pending_reads.is_empty() && q.pending_writes.is_empty() {
                if q.shutdown {
                    debug!("Paging worker exiting");
                    return;
                }
                self.pending_cvar.wait(&mut q);
            }

            // Reads always go first.
            let Some((page, target)) = q
                .pending_reads
                .pop_front()
                .or_else(|| q.pending_writes.pop_front())
            else {
                continue;
            };

            q.working_page = Some(page.id());
            let landed = MutexGuard::unlocked(&mut q, || page.service(target));
            q.working_page = None;
            q.stats.total_completed += 1;
            self.working_cvar.notify_all();

            // The landing tier may now be over budget. Nothing is marked in
            // service while this runs.
            if let Some(tier) = landed {
                q.evicting = true;
                MutexGuard::unlocked(&mut q, || page.shared().consider_evict(tier));
                q.evicting = false;
                self.working_cvar.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::allocator::Allocatable;
    use crate::config::Config;
    use crate::context::PagingContext;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn threaded_context(tmp: &TempDir) -> PagingContext {
        let mut config = Config::default();
        config.backing_store.directory = Some(tmp.path().to_path_buf());
        PagingContext::new(config)
    }

    fn page(ctx: &PagingContext, len: usize, fill: u8) -> Arc<Page> {
        let page = Page::new(Arc::clone(ctx.shared()), len);
        page.lock().data = Some(vec![fill; len]);
        page
    }

    /// Queue `blocker` and keep its lock so the worker picks it up and then
    /// stalls until the returned guard is dropped.
    fn stall_worker<'a>(ctx: &PagingContext, blocker: &'a Arc<Page>) -> MutexGuard<'a, PageState> {
        let mut st = blocker.lock();
        assert!(ctx.coordinator().request(blocker, &mut st, Tier::Disk));
        while ctx.coordinator().pending_writes() > 0 {
            std::thread::yield_now();
        }
        st
    }

    /// Idle pages sit on their tier's chain, queued ones on the pending chain.
    fn assert_on_expected_chain(ctx: &PagingContext, p: &Arc<Page>) {
        let st = p.lock();
        let expected = if st.pending_ram_class == st.ram_class {
            ctx.chain(st.ram_class)
        } else {
            ctx.shared().chains.pending
        };
        assert_eq!(ctx.lru().chain_of(p.lru_handle()), Some(expected));
    }

    #[test]
    fn test_worker_applies_requests() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        let p = page(&ctx, 1024, 3);

        p.request_tier(Tier::Disk).unwrap();
        ctx.flush_background_worker();
        assert_eq!(p.tier(), Tier::Disk);
        assert_eq!(p.pending_tier(), Tier::Disk);

        p.request_tier(Tier::Resident).unwrap();
        ctx.flush_background_worker();
        assert_eq!(p.tier(), Tier::Resident);
        assert_eq!(p.lock().data.as_deref(), Some(&[3u8; 1024][..]));
        assert!(ctx.coordinator().stats().total_completed >= 2);
    }

    #[test]
    fn test_cancel_before_start() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        let a = page(&ctx, 256, 1);
        let b = page(&ctx, 256, 2);

        let held = stall_worker(&ctx, &a);

        b.request_tier(Tier::Disk).unwrap();
        assert_eq!(b.pending_tier(), Tier::Disk);
        assert_eq!(ctx.coordinator().pending_writes(), 1);
        assert_eq!(
            ctx.lru().chain_of(b.lru_handle()),
            Some(ctx.shared().chains.pending)
        );

        {
            let mut st = b.lock();
            b.make_resident_now(&mut st).unwrap();
            assert_eq!(st.ram_class, Tier::Resident);
            assert_eq!(st.pending_ram_class, Tier::Resident);
            assert!(st.saved_block.is_none());
        }
        assert_eq!(ctx.coordinator().pending_writes(), 0);

        drop(held);
        ctx.flush_background_worker();
        assert_eq!(a.tier(), Tier::Disk);
        assert_eq!(b.tier(), Tier::Resident);
        let store = ctx.backing_store().unwrap();
        assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.coordinator().stats().total_cancelled, 1);
    }

    #[test]
    fn test_reads_jump_ahead_of_writes() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        let blocker = page(&ctx, 64, 0);
        let writer = page(&ctx, 64, 1);
        let reader = page(&ctx, 64, 2);

        reader.request_tier(Tier::Disk).unwrap();
        ctx.flush_background_worker();

        let held = stall_worker(&ctx, &blocker);

        writer.request_tier(Tier::Disk).unwrap();
        reader.request_tier(Tier::Resident).unwrap();
        assert_eq!(ctx.coordinator().pending_reads(), 1);
        assert_eq!(ctx.coordinator().pending_writes(), 1);

        drop(held);
        ctx.flush_background_worker();
        assert_eq!(reader.tier(), Tier::Resident);
        assert_eq!(writer.tier(), Tier::Disk);
    }

    #[test]
    fn test_changed_request_replaces_queued_one() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tiers.max_compressed = None;
        config.backing_store.directory = Some(tmp.path().to_path_buf());
        let ctx = PagingContext::new(config);
        let blocker = page(&ctx, 64, 0);
        let p = page(&ctx, 4096, 7);

        let held = stall_worker(&ctx, &blocker);

        p.request_tier(Tier::Disk).unwrap();
        p.request_tier(Tier::Compressed).unwrap();
        assert_eq!(ctx.coordinator().pending_writes(), 1);
        assert_eq!(p.pending_tier(), Tier::Compressed);

        drop(held);
        ctx.flush_background_worker();
        assert_eq!(p.tier(), Tier::Compressed);
        assert!(!p.has_saved_block());
        assert_on_expected_chain(&ctx, &p);
    }

    #[test]
    fn test_requesting_current_tier_withdraws_queued_request() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        let blocker = page(&ctx, 64, 0);
        let p = page(&ctx, 1024, 5);

        let held = stall_worker(&ctx, &blocker);

        p.request_tier(Tier::Disk).unwrap();
        assert_eq!(ctx.coordinator().pending_writes(), 1);
        assert_on_expected_chain(&ctx, &p);

        p.request_tier(Tier::Resident).unwrap();
        assert_eq!(ctx.coordinator().pending_reads(), 0);
        assert_eq!(ctx.coordinator().pending_writes(), 0);
        assert_eq!(p.pending_tier(), Tier::Resident);
        assert_eq!(
            ctx.lru().chain_of(p.lru_handle()),
            Some(ctx.chain(Tier::Resident))
        );

        drop(held);
        ctx.flush_background_worker();
        assert_eq!(p.tier(), Tier::Resident);
        assert_on_expected_chain(&ctx, &p);
        assert_on_expected_chain(&ctx, &blocker);
        let stats = ctx.coordinator().stats();
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.total_completed, 1);
    }

    #[test]
    fn test_follow_up_eviction_runs_outside_service() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.tiers.max_resident = Some(1500);
        config.backing_store.directory = Some(tmp.path().to_path_buf());
        let ctx = PagingContext::new(config);
        let book = ctx.new_book(1024);

        let a = book.alloc(1024).unwrap();
        let b = book.alloc(1024).unwrap();
        ctx.flush_background_worker();
        assert_eq!(a.tier(), Tier::Disk);
        assert_eq!(b.tier(), Tier::Resident);

        // Restoring `a` puts the resident chain over budget; evicting `b`
        // afterwards stalls on its lock.
        let held = b.page().lock();
        let completed = ctx.coordinator().stats().total_completed;
        a.request_tier(Tier::Resident).unwrap();
        while ctx.coordinator().stats().total_completed == completed {
            std::thread::yield_now();
        }
        assert_eq!(a.tier(), Tier::Resident);

        // `a` is out of service, so withdrawing a new request for it does
        // not wait on the eviction pass.
        a.request_tier(Tier::Disk).unwrap();
        assert_eq!(a.pending_tier(), Tier::Disk);
        {
            let mut st = a.page().lock();
            a.page().make_resident_now(&mut st).unwrap();
        }
        assert_eq!(a.pending_tier(), Tier::Resident);
        assert_eq!(ctx.coordinator().pending_writes(), 0);

        drop(held);
        ctx.flush_background_worker();
        ctx.enforce_ceilings();
        ctx.flush_background_worker();
        assert!(ctx.tier_stats(Tier::Resident).bytes_used <= 1500);
        assert_on_expected_chain(&ctx, a.page());
        assert_on_expected_chain(&ctx, b.page());
    }

    #[test]
    fn test_stop_drains_queue() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        let pages: Vec<_> = (0..8u8).map(|i| page(&ctx, 512, i)).collect();

        for p in &pages {
            p.request_tier(Tier::Disk).unwrap();
        }
        ctx.stop_background_worker();
        assert!(!ctx.coordinator().is_running());

        for (i, p) in pages.iter().enumerate() {
            assert_eq!(p.tier(), Tier::Disk);
            assert_eq!(p.pending_tier(), Tier::Disk);
            p.request_tier(Tier::Resident).unwrap();
            assert_eq!(p.lock().data.as_deref(), Some(&vec![i as u8; 512][..]));
        }
        assert_eq!(pages[0].capacity(), 512);
    }

    #[test]
    fn test_restart_after_stop() {
        let tmp = TempDir::new().unwrap();
        let ctx = threaded_context(&tmp);
        ctx.stop_background_worker();

        let p = page(&ctx, 128, 9);
        p.request_tier(Tier::Disk).unwrap();
        // Ran inline.
        assert_eq!(p.tier(), Tier::Disk);

        ctx.start_background_worker();
        assert!(ctx.coordinator().is_running());
        p.request_tier(Tier::Resident).unwrap();
        ctx.flush_background_worker();
        assert_eq!(p.tier(), Tier::Resident);
    }
}
