//! First-fit sub-allocator for a fixed-capacity byte region.
//!
//! Live blocks are kept in a chain sorted by start offset; free space is the
//! implicit gap between neighbours. Chain nodes live in an arena addressed by
//! index, and every handed-out [`Allocation`] carries the slot's generation so
//! a stale or doubly-freed handle is rejected instead of corrupting the chain.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("No contiguous region of {requested} bytes available (largest free: {contiguous})")]
    Exhausted { requested: usize, contiguous: usize },

    #[error("Allocation at offset {start} is not live in this allocator")]
    StaleAllocation { start: usize },
}

/// A live byte range handed out by a [`BlockAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    index: u32,
    generation: u32,
    start: usize,
    size: usize,
}

impl Allocation {
    /// Offset of the first byte.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// The range covered by this allocation.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }
}

/// What changed when a block was freed.
///
/// The owner uses this to react to capacity changes, e.g. to drop a page
/// whose last block went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeOutcome {
    /// The largest-contiguous estimate grew.
    pub contiguous_changed: bool,
    /// No live blocks remain.
    pub now_empty: bool,
}

/// Something that hands out byte ranges from its own region.
pub trait Allocatable {
    /// Reserve `size` bytes.
    fn allocate(&self, size: usize) -> Result<Allocation, AllocError>;

    /// Return a range previously handed out by [`Allocatable::allocate`].
    fn release(&self, allocation: Allocation) -> Result<FreeOutcome, AllocError>;

    /// Whether no ranges are live.
    fn is_empty(&self) -> bool;

    /// Size of the region in bytes.
    fn capacity(&self) -> usize;
}

#[derive(Debug)]
struct Span {
    start: usize,
    size: usize,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    span: Option<Span>,
}

/// First-fit allocator over `[0, capacity)`.
#[derive(Debug)]
pub struct BlockAllocator {
    capacity: usize,
    total_size: usize,
    /// Upper bound on the largest single allocation that could succeed.
    contiguous: usize,
    live: usize,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
}

impl BlockAllocator {
    /// Create an empty allocator managing `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            total_size: 0,
            contiguous: capacity,
            live: 0,
            slots: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Reserve `size` bytes at the lowest offset that fits.
    ///
    /// Fails without attempting to defragment. A failed scan recomputes the
    /// largest-contiguous estimate exactly.
    pub fn alloc(&mut self, size: usize) -> Result<Allocation, AllocError> {
        if size > self.contiguous {
            return Err(AllocError::Exhausted {
                requested: size,
                contiguous: self.contiguous,
            });
        }

        let mut best = 0;
        let mut end = 0;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let span = self.span(idx);
            let free = span.start - end;
            if free >= size {
                return Ok(self.insert_before(Some(idx), end, size));
            }
            best = best.max(free);
            end = span.start + span.size;
            cursor = span.next;
        }

        let free = self.capacity - end;
        if free >= size {
            return Ok(self.insert_before(None, end, size));
        }
        best = best.max(free);

        self.contiguous = best;
        Err(AllocError::Exhausted {
            requested: size,
            contiguous: best,
        })
    }

    /// Release a live allocation.
    pub fn free(&mut self, allocation: Allocation) -> Result<FreeOutcome, AllocError> {
        let idx = allocation.index;
        let live = self
            .slots
            .get(idx as usize)
            .filter(|slot| slot.generation == allocation.generation)
            .and_then(|slot| slot.span.as_ref())
            .map(|span| span.start == allocation.start && span.size == allocation.size)
            .unwrap_or(false);
        if !live {
            return Err(AllocError::StaleAllocation {
                start: allocation.start,
            });
        }

        let (prev, next) = self.unlink(idx);
        self.total_size -= allocation.size;
        self.live -= 1;

        let gap_start = prev.map(|p| self.span(p).start + self.span(p).size).unwrap_or(0);
        let gap_end = next.map(|n| self.span(n).start).unwrap_or(self.capacity);
        let gap = gap_end - gap_start;
        let contiguous_changed = gap > self.contiguous;
        if contiguous_changed {
            self.contiguous = gap;
        }

        Ok(FreeOutcome {
            contiguous_changed,
            now_empty: self.live == 0,
        })
    }

    /// Size of the managed region.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of all live block sizes.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Conservative upper bound on the largest allocation that could succeed.
    pub fn largest_contiguous(&self) -> usize {
        self.contiguous
    }

    /// Live blocks in offset order, as `(start, size)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let span = self.span(idx);
            cursor = span.next;
            Some((span.start, span.size))
        })
    }

    /// Check chain order, overlap, bounds and the tracked total.
    pub fn validate(&self) -> bool {
        let mut end = 0;
        let mut sum = 0;
        let mut count = 0;
        for (start, size) in self.iter() {
            if start < end || start + size > self.capacity {
                return false;
            }
            end = start + size;
            sum += size;
            count += 1;
        }
        sum == self.total_size && count == self.live && self.total_size <= self.capacity
    }

    fn span(&self, idx: u32) -> &Span {
        match self.slots[idx as usize].span.as_ref() {
            Some(span) => span,
            None => unreachable!("chain references vacant slot {idx}"),
        }
    }

    fn span_mut(&mut self, idx: u32) -> &mut Span {
        match self.slots[idx as usize].span.as_mut() {
            Some(span) => span,
            None => unreachable!("chain references vacant slot {idx}"),
        }
    }

    /// Link a new span in front of `before` (or at the tail).
    fn insert_before(&mut self, before: Option<u32>, start: usize, size: usize) -> Allocation {
        let prev = match before {
            Some(b) => self.span(b).prev,
            None => self.tail,
        };
        let span = Span {
            start,
            size,
            prev,
            next: before,
        };

        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize].span = Some(span);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    span: Some(span),
                });
                (self.slots.len() - 1) as u32
            }
        };

        match prev {
            Some(p) => self.span_mut(p).next = Some(index),
            None => self.head = Some(index),
        }
        match before {
            Some(b) => self.span_mut(b).prev = Some(index),
            None => self.tail = Some(index),
        }

        self.total_size += size;
        self.live += 1;

        Allocation {
            index,
            generation: self.slots[index as usize].generation,
            start,
            size,
        }
    }

    /// Unlink and vacate a slot, returning its former neighbours.
    fn unlink(&mut self, idx: u32) -> (Option<u32>, Option<u32>) {
        let slot = &mut self.slots[idx as usize];
        let span = match slot.span.take() {
            Some(span) => span,
            None => unreachable!("unlink of vacant slot {idx}"),
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_slots.push(idx);

        match span.prev {
            Some(p) => self.span_mut(p).next = span.next,
            None => self.head = span.next,
        }
        match span.next {
            Some(n) => self.span_mut(n).prev = span.prev,
            None => self.tail = span.prev,
        }
        (span.prev, span.next)
    }
}
