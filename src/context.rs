//! The paging context: everything the tiers share.
//!
//! A [`PagingContext`] owns the LRU registry with one chain per tier, the
//! compressor, the lazily opened backing store and the background worker.
//! Books created from it keep the shared state alive, so pages outlive the
//! context handle if blocks are still held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::cache::block::{Tier, TierStats};
use crate::cache::book::Book;
use crate::cache::compressor::Compressor;
use crate::cache::lru::{ChainId, LruRegistry};
use crate::cache::page::PageId;
use crate::config::Config;
use crate::transfer::backing_store::BackingStore;
use crate::transfer::coordinator::PagingCoordinator;

/// LRU chain ids for the three tiers, plus the chain that parks queued pages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TierChains {
    pub(crate) resident: ChainId,
    pub(crate) compressed: ChainId,
    pub(crate) disk: ChainId,
    pub(crate) pending: ChainId,
}

pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) lru: LruRegistry,
    pub(crate) chains: TierChains,
    pub(crate) compressor: Compressor,
    pub(crate) coordinator: Arc<PagingCoordinator>,
    /// `Some(None)` once opening has failed: the disk tier stays off.
    backing_store: OnceLock<Option<Arc<BackingStore>>>,
    next_page_id: AtomicU64,
}

impl Shared {
    pub(crate) fn chain(&self, tier: Tier) -> ChainId {
        match tier {
            Tier::Resident => self.chains.resident,
            Tier::Compressed => self.chains.compressed,
            Tier::Disk => self.chains.disk,
        }
    }

    /// A zero ceiling takes the compressed tier out of the eviction ladder.
    pub(crate) fn compressed_enabled(&self) -> bool {
        self.lru.max_size(self.chains.compressed) > 0
    }

    /// The backing store, opened on first use.
    pub(crate) fn backing_store(&self) -> Option<Arc<BackingStore>> {
        self.backing_store
            .get_or_init(|| {
                match BackingStore::open(&self.config.backing_store, self.config.disk_budget()) {
                    Ok(store) => Some(Arc::new(store)),
                    Err(e) => {
                        warn!(error = %e, "Disk tier disabled");
                        None
                    }
                }
            })
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn disable_disk_tier(&self) {
        let _ = self.backing_store.set(None);
    }

    /// Bring a tier back under its ceiling. Must be called with no page lock
    /// held.
    pub(crate) fn consider_evict(&self, tier: Tier) {
        match tier {
            Tier::Resident | Tier::Compressed => self.lru.consider_evict(self.chain(tier)),
            Tier::Disk => {}
        }
    }

    pub(crate) fn next_page_id(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Entry point: owns the tiers and the worker.
///
/// Dropping the context stops the background worker after it has drained
/// its queues.
pub struct PagingContext {
    shared: Arc<Shared>,
}

impl PagingContext {
    pub fn new(config: Config) -> Self {
        let lru = LruRegistry::new();
        let compressed_budget = if config.tiers.compressed_enabled() {
            config.compressed_budget()
        } else {
            0
        };
        let chains = TierChains {
            resident: lru.add_chain("resident", config.resident_budget()),
            compressed: lru.add_chain("compressed", compressed_budget),
            // Disk usage is bounded by the backing store, not by eviction.
            disk: lru.add_chain("disk", usize::MAX),
            pending: lru.add_chain("pending", usize::MAX),
        };

        info!(
            max_resident = ?config.tiers.max_resident,
            max_compressed = ?config.tiers.max_compressed,
            max_disk = ?config.tiers.max_disk,
            background_worker = config.paging.background_worker,
            "Paging context initialized"
        );

        let shared = Arc::new(Shared {
            compressor: Compressor::new(config.compression.clone()),
            lru,
            chains,
            coordinator: Arc::new(PagingCoordinator::new()),
            backing_store: OnceLock::new(),
            next_page_id: AtomicU64::new(1),
            config,
        });
        if shared.config.paging.background_worker {
            shared.coordinator.start();
        }

        Self { shared }
    }

    /// Load configuration from a JSON file and build a context from it.
    pub fn from_config_file(path: &std::path::Path) -> anyhow::Result<Self> {
        Ok(Self::new(Config::load(path)?))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// A new book whose pages default to `page_size` bytes.
    pub fn new_book(&self, page_size: usize) -> Book {
        Book::new(Arc::clone(&self.shared), page_size)
    }

    /// A new book using the configured default page size.
    pub fn new_default_book(&self) -> Book {
        self.new_book(self.shared.config.paging.default_page_size)
    }

    /// Start a new frame: soft-evict every RAM tier to its ceiling, then
    /// protect whatever is touched from here on against soft eviction.
    pub fn begin_epoch(&self) {
        self.shared.lru.begin_epoch(self.shared.chains.resident);
        self.shared.lru.begin_epoch(self.shared.chains.compressed);
    }

    /// Evict from `tier` until it holds at most `target` bytes. Soft eviction
    /// spares pages touched during the current epoch.
    pub fn evict_to(&self, tier: Tier, target: usize, hard: bool) {
        self.shared.lru.evict_to(self.shared.chain(tier), target, hard);
    }

    /// Bring every RAM tier back under its ceiling.
    pub fn enforce_ceilings(&self) {
        self.shared.consider_evict(Tier::Resident);
        self.shared.consider_evict(Tier::Compressed);
    }

    /// Change a tier's ceiling at runtime (`None` for unbounded) and evict
    /// down to it. Setting the compressed ceiling to zero disables that tier.
    pub fn set_max_size(&self, tier: Tier, max_size: Option<usize>) {
        let chain = self.shared.chain(tier);
        self.shared
            .lru
            .set_max_size(chain, max_size.unwrap_or(usize::MAX));
        self.shared.consider_evict(tier);
    }

    /// Usage of one tier.
    pub fn tier_stats(&self, tier: Tier) -> TierStats {
        let chain = self.shared.chain(tier);
        let capacity = match tier {
            Tier::Disk => self.shared.config.tiers.max_disk,
            _ => Some(self.shared.lru.max_size(chain)).filter(|&max| max != usize::MAX),
        };
        TierStats {
            page_count: self.shared.lru.len(chain),
            bytes_used: self.shared.lru.total_size(chain),
            capacity,
        }
    }

    /// Run queued transitions on a background thread from now on.
    pub fn start_background_worker(&self) {
        self.shared.coordinator.start();
    }

    /// Drain the queues and stop the worker. Later transitions run inline.
    pub fn stop_background_worker(&self) {
        self.shared.coordinator.stop();
    }

    /// Block until the worker has nothing left to do.
    pub fn flush_background_worker(&self) {
        self.shared.coordinator.wait_idle();
    }

    pub fn coordinator(&self) -> &PagingCoordinator {
        &self.shared.coordinator
    }

    /// The backing store, opening it if needed. None if the disk tier is
    /// unavailable.
    pub fn backing_store(&self) -> Option<Arc<BackingStore>> {
        self.shared.backing_store()
    }

    pub fn lru(&self) -> &LruRegistry {
        &self.shared.lru
    }

    pub fn chain(&self, tier: Tier) -> ChainId {
        self.shared.chain(tier)
    }

    /// Check the integrity of every LRU chain.
    pub fn validate(&self) -> bool {
        self.shared.lru.validate()
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for PagingContext {
    fn drop(&mut self) {
        self.shared.coordinator.stop();
    }
}
