//! In-memory side of the pager.
//!
//! - [`allocator`]: first-fit sub-allocator used by pages and the backing store
//! - [`lru`]: multi-chain LRU registry with epoch protection
//! - [`page`]: pages and their tier state machine
//! - [`book`]: growable page collections that serve allocations
//! - [`block`]: Tier definitions and the block handle
//! - [`compressor`]: zstd compression for the compressed tier

pub mod allocator;
pub mod block;
pub mod book;
pub mod compressor;
pub mod lru;
pub mod page;
