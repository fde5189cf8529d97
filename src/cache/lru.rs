//! Recency tracking shared by every residency tier.
//!
//! One [`LruRegistry`] owns any number of chains (one per tier, plus a
//! neutral "pending" chain) behind a single lock. Members are referenced by
//! generation-checked [`LruHandle`]s into an arena, so a member that is
//! unregistered while someone still holds its handle cannot alias a new one.
//!
//! Each chain also owns an epoch marker. [`LruRegistry::begin_epoch`] moves
//! the marker to the tail; members touched afterwards sit behind it and are
//! spared by soft eviction for the rest of the epoch.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

/// A participant in an LRU chain.
pub trait RecencyMember: Send + Sync {
    /// Called when the member's chain is over budget and this member is the
    /// least recently used.
    ///
    /// The registry lock is not held. The member may move itself to another
    /// chain, re-mark itself used, or do nothing (it will be asked again on a
    /// later pass).
    fn evict_lru(self: Arc<Self>);
}

/// Identifies one chain within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(usize);

/// Stable reference to a registered member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LruHandle {
    index: u32,
    generation: u32,
}

enum NodeKind {
    Member(Weak<dyn RecencyMember>),
    Marker,
}

struct Node {
    kind: NodeKind,
    weight: usize,
    chain: Option<ChainId>,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

struct Chain {
    name: String,
    max_size: usize,
    total_size: usize,
    members: usize,
    head: Option<u32>,
    tail: Option<u32>,
    marker: u32,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    chains: Vec<Chain>,
}

impl Arena {
    fn alloc(&mut self, node: Node) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].node = Some(node);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn node(&self, idx: u32) -> &Node {
        match self.slots[idx as usize].node.as_ref() {
            Some(node) => node,
            None => unreachable!("lru chain references vacant slot {idx}"),
        }
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node {
        match self.slots[idx as usize].node.as_mut() {
            Some(node) => node,
            None => unreachable!("lru chain references vacant slot {idx}"),
        }
    }

    /// Resolve a handle, rejecting stale ones.
    fn resolve(&self, handle: LruHandle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        (slot.generation == handle.generation && slot.node.is_some()).then_some(handle.index)
    }

    fn is_member(&self, idx: u32) -> bool {
        matches!(self.node(idx).kind, NodeKind::Member(_))
    }

    fn unlink(&mut self, idx: u32) {
        let (chain, prev, next, weight) = {
            let node = self.node(idx);
            match node.chain {
                Some(chain) => (chain, node.prev, node.next, node.weight),
                None => return,
            }
        };
        let member = self.is_member(idx);

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.chains[chain.0].head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.chains[chain.0].tail = prev,
        }

        let c = &mut self.chains[chain.0];
        c.total_size -= weight;
        if member {
            c.members -= 1;
        }

        let node = self.node_mut(idx);
        node.chain = None;
        node.prev = None;
        node.next = None;
    }

    fn link_tail(&mut self, idx: u32, chain: ChainId) {
        let old_tail = self.chains[chain.0].tail;
        let weight = self.node(idx).weight;
        let member = self.is_member(idx);

        {
            let node = self.node_mut(idx);
            node.chain = Some(chain);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(idx),
            None => self.chains[chain.0].head = Some(idx),
        }

        let c = &mut self.chains[chain.0];
        c.tail = Some(idx);
        c.total_size += weight;
        if member {
            c.members += 1;
        }
    }

    /// Members that soft (or hard) eviction may visit, oldest first.
    fn eviction_candidates(
        &self,
        chain: ChainId,
        hard: bool,
    ) -> Vec<(LruHandle, Weak<dyn RecencyMember>)> {
        let mut out = Vec::with_capacity(self.chains[chain.0].members);
        let mut cursor = self.chains[chain.0].head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            match &node.kind {
                NodeKind::Marker if !hard => break,
                NodeKind::Marker => {}
                NodeKind::Member(member) => out.push((
                    LruHandle {
                        index: idx,
                        generation: self.slots[idx as usize].generation,
                    },
                    member.clone(),
                )),
            }
            cursor = node.next;
        }
        out
    }
}

/// The process-shared recency tracker.
pub struct LruRegistry {
    arena: Mutex<Arena>,
}

impl Default for LruRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LruRegistry {
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
        }
    }

    /// Add a chain with the given budget (`usize::MAX` for unbounded).
    pub fn add_chain(&self, name: impl Into<String>, max_size: usize) -> ChainId {
        let mut arena = self.arena.lock();
        let marker = arena.alloc(Node {
            kind: NodeKind::Marker,
            weight: 0,
            chain: None,
            prev: None,
            next: None,
        });
        let id = ChainId(arena.chains.len());
        arena.chains.push(Chain {
            name: name.into(),
            max_size,
            total_size: 0,
            members: 0,
            head: None,
            tail: None,
            marker,
        });
        id
    }

    /// Register a member, initially in no chain.
    pub fn register(&self, member: Weak<dyn RecencyMember>, weight: usize) -> LruHandle {
        let mut arena = self.arena.lock();
        let index = arena.alloc(Node {
            kind: NodeKind::Member(member),
            weight,
            chain: None,
            prev: None,
            next: None,
        });
        LruHandle {
            index,
            generation: arena.slots[index as usize].generation,
        }
    }

    /// Remove a member for good. The handle becomes stale.
    pub fn unregister(&self, handle: LruHandle) {
        let mut arena = self.arena.lock();
        let Some(idx) = arena.resolve(handle) else {
            debug_assert!(false, "unregister of stale lru handle {handle:?}");
            return;
        };
        arena.unlink(idx);
        let slot = &mut arena.slots[idx as usize];
        slot.node = None;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(idx);
    }

    /// Move the member to the most-recently-used end of `chain`, enqueueing
    /// it if it is in no chain or leaving whatever chain it was in.
    pub fn mark_used(&self, handle: LruHandle, chain: ChainId) {
        let mut arena = self.arena.lock();
        let Some(idx) = arena.resolve(handle) else {
            debug_assert!(false, "mark_used of stale lru handle {handle:?}");
            return;
        };
        arena.unlink(idx);
        arena.link_tail(idx, chain);
    }

    /// Alias of [`LruRegistry::mark_used`] for a member not yet in any chain.
    pub fn enqueue(&self, handle: LruHandle, chain: ChainId) {
        self.mark_used(handle, chain);
    }

    /// Take the member out of whatever chain holds it.
    pub fn dequeue(&self, handle: LruHandle) {
        let mut arena = self.arena.lock();
        if let Some(idx) = arena.resolve(handle) {
            arena.unlink(idx);
        }
    }

    /// Change a member's weight, adjusting its chain's total.
    pub fn set_weight(&self, handle: LruHandle, weight: usize) {
        let mut arena = self.arena.lock();
        let Some(idx) = arena.resolve(handle) else {
            debug_assert!(false, "set_weight of stale lru handle {handle:?}");
            return;
        };
        let node = arena.node_mut(idx);
        let old = std::mem::replace(&mut node.weight, weight);
        if let Some(chain) = node.chain {
            let c = &mut arena.chains[chain.0];
            c.total_size = c.total_size - old + weight;
        }
    }

    /// Which chain currently holds the member.
    pub fn chain_of(&self, handle: LruHandle) -> Option<ChainId> {
        let arena = self.arena.lock();
        arena.resolve(handle).and_then(|idx| arena.node(idx).chain)
    }

    pub fn weight(&self, handle: LruHandle) -> Option<usize> {
        let arena = self.arena.lock();
        arena.resolve(handle).map(|idx| arena.node(idx).weight)
    }

    /// Sum of member weights in the chain.
    pub fn total_size(&self, chain: ChainId) -> usize {
        self.arena.lock().chains[chain.0].total_size
    }

    pub fn max_size(&self, chain: ChainId) -> usize {
        self.arena.lock().chains[chain.0].max_size
    }

    pub fn set_max_size(&self, chain: ChainId, max_size: usize) {
        self.arena.lock().chains[chain.0].max_size = max_size;
    }

    /// Number of members in the chain.
    pub fn len(&self, chain: ChainId) -> usize {
        self.arena.lock().chains[chain.0].members
    }

    pub fn is_empty(&self, chain: ChainId) -> bool {
        self.len(chain) == 0
    }

    /// Members of the chain from least to most recently used.
    pub fn members(&self, chain: ChainId) -> Vec<LruHandle> {
        let arena = self.arena.lock();
        arena
            .eviction_candidates(chain, true)
            .into_iter()
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Soft-evict if the chain is over its budget.
    pub fn consider_evict(&self, chain: ChainId) {
        let (total, max) = {
            let arena = self.arena.lock();
            let c = &arena.chains[chain.0];
            (c.total_size, c.max_size)
        };
        if total > max {
            self.evict_to(chain, max, false);
        }
    }

    /// Evict least-recently-used members until the chain's total is at most
    /// `target_size`.
    ///
    /// Soft eviction (`hard == false`) stops at the epoch marker. Each
    /// member is visited at most once per call, so members that refuse to
    /// leave cannot spin this loop.
    pub fn evict_to(&self, chain: ChainId, target_size: usize, hard: bool) {
        let candidates = {
            let arena = self.arena.lock();
            let c = &arena.chains[chain.0];
            if c.total_size <= target_size {
                return;
            }
            trace!(
                chain = %c.name,
                total = c.total_size,
                target = target_size,
                hard,
                "Evicting"
            );
            arena.eviction_candidates(chain, hard)
        };

        let mut evicted = 0usize;
        for (handle, member) in candidates {
            {
                let arena = self.arena.lock();
                if arena.chains[chain.0].total_size <= target_size {
                    break;
                }
                let still_here = arena
                    .resolve(handle)
                    .map(|idx| arena.node(idx).chain == Some(chain))
                    .unwrap_or(false);
                if !still_here {
                    continue;
                }
            }
            // The lock is released here: eviction re-enters the registry.
            if let Some(member) = member.upgrade() {
                member.evict_lru();
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                chain = %self.arena.lock().chains[chain.0].name,
                evicted,
                "Eviction pass complete"
            );
        }
    }

    /// Start a new epoch: soft-evict down to budget, then move the marker to
    /// the tail so everything touched from now on counts as active.
    pub fn begin_epoch(&self, chain: ChainId) {
        let max = self.max_size(chain);
        self.evict_to(chain, max, false);

        let mut arena = self.arena.lock();
        let marker = arena.chains[chain.0].marker;
        arena.unlink(marker);
        arena.link_tail(marker, chain);
    }

    /// Walk every chain and check linkage, membership and weight totals.
    pub fn validate(&self) -> bool {
        let arena = self.arena.lock();
        for (i, chain) in arena.chains.iter().enumerate() {
            let id = ChainId(i);
            let mut sum = 0;
            let mut members = 0;
            let mut prev = None;
            let mut cursor = chain.head;
            let mut steps = 0;
            while let Some(idx) = cursor {
                let node = arena.node(idx);
                if node.chain != Some(id) || node.prev != prev {
                    return false;
                }
                sum += node.weight;
                if matches!(node.kind, NodeKind::Member(_)) {
                    members += 1;
                }
                prev = Some(idx);
                cursor = node.next;
                steps += 1;
                if steps > arena.slots.len() {
                    return false;
                }
            }
            if prev != chain.tail || sum != chain.total_size || members != chain.members {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    /// Dequeues itself when evicted, like a plain cache entry.
    struct Entry {
        lru: Arc<LruRegistry>,
        handle: OnceLock<LruHandle>,
        evictions: AtomicUsize,
    }

    impl RecencyMember for Entry {
        fn evict_lru(self: Arc<Self>) {
            self.evictions.fetch_add(1, Ordering::SeqCst);
            if let Some(&handle) = self.handle.get() {
                self.lru.dequeue(handle);
            }
        }
    }

    fn entry(lru: &Arc<LruRegistry>, weight: usize) -> (Arc<Entry>, LruHandle) {
        let entry = Arc::new(Entry {
            lru: Arc::clone(lru),
            handle: OnceLock::new(),
            evictions: AtomicUsize::new(0),
        });
        let weak: Weak<dyn RecencyMember> = Arc::downgrade(&entry) as Weak<dyn RecencyMember>;
        let handle = lru.register(weak, weight);
        entry.handle.set(handle).unwrap();
        (entry, handle)
    }

    #[test]
    fn test_totals_track_weights() {
        let lru = Arc::new(LruRegistry::new());
        let a = lru.add_chain("a", usize::MAX);
        let b = lru.add_chain("b", usize::MAX);

        let (_e1, h1) = entry(&lru, 10);
        let (_e2, h2) = entry(&lru, 20);
        lru.enqueue(h1, a);
        lru.enqueue(h2, a);
        assert_eq!(lru.total_size(a), 30);

        lru.mark_used(h1, b);
        assert_eq!(lru.total_size(a), 20);
        assert_eq!(lru.total_size(b), 10);

        lru.set_weight(h2, 5);
        assert_eq!(lru.total_size(a), 5);
        assert!(lru.validate());

        lru.unregister(h2);
        assert_eq!(lru.total_size(a), 0);
        assert_eq!(lru.chain_of(h2), None);
        assert!(lru.validate());
    }

    #[test]
    fn test_evicts_least_recent_first() {
        let lru = Arc::new(LruRegistry::new());
        let chain = lru.add_chain("resident", 25);
        let entries: Vec<_> = (0..3).map(|_| entry(&lru, 10)).collect();
        for (_, h) in &entries {
            lru.enqueue(*h, chain);
        }
        // Touch the first one so the second becomes the oldest.
        lru.mark_used(entries[0].1, chain);

        lru.consider_evict(chain);
        assert_eq!(lru.total_size(chain), 20);
        assert_eq!(entries[1].0.evictions.load(Ordering::SeqCst), 1);
        assert_eq!(entries[0].0.evictions.load(Ordering::SeqCst), 0);
        assert_eq!(lru.members(chain), vec![entries[2].1, entries[0].1]);
    }

    #[test]
    fn test_soft_eviction_spares_current_epoch() {
        let lru = Arc::new(LruRegistry::new());
        let chain = lru.add_chain("resident", 100);
        let (old, h_old) = entry(&lru, 10);
        lru.enqueue(h_old, chain);

        lru.begin_epoch(chain);
        let (new, h_new) = entry(&lru, 10);
        lru.enqueue(h_new, chain);

        lru.evict_to(chain, 0, false);
        assert_eq!(old.evictions.load(Ordering::SeqCst), 1);
        assert_eq!(new.evictions.load(Ordering::SeqCst), 0);
        assert_eq!(lru.total_size(chain), 10);

        lru.evict_to(chain, 0, true);
        assert_eq!(new.evictions.load(Ordering::SeqCst), 1);
        assert_eq!(lru.total_size(chain), 0);
        assert!(lru.validate());
    }

    #[test]
    fn test_stubborn_member_visited_once() {
        struct Stubborn(AtomicUsize);
        impl RecencyMember for Stubborn {
            fn evict_lru(self: Arc<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let lru = LruRegistry::new();
        let chain = lru.add_chain("stubborn", 0);
        let member = Arc::new(Stubborn(AtomicUsize::new(0)));
        let weak: Weak<dyn RecencyMember> = Arc::downgrade(&member) as Weak<dyn RecencyMember>;
        let handle = lru.register(weak, 8);
        lru.enqueue(handle, chain);

        lru.evict_to(chain, 0, true);
        assert_eq!(member.0.load(Ordering::SeqCst), 1);
        assert_eq!(lru.total_size(chain), 8);
    }

    #[test]
    fn test_dropped_member_is_skipped() {
        let lru = Arc::new(LruRegistry::new());
        let chain = lru.add_chain("resident", 0);
        let (e, h) = entry(&lru, 4);
        lru.enqueue(h, chain);
        drop(e);
        lru.evict_to(chain, 0, true);
        assert_eq!(lru.total_size(chain), 4);
        lru.unregister(h);
        assert_eq!(lru.total_size(chain), 0);
    }
}
