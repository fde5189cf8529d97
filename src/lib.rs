//! tiered-pager: a three-tier memory residency manager.
//!
//! Bytes are handed out as [`Block`]s carved from [`Page`]s. Pages move
//! between three tiers under per-tier byte ceilings, least recently used
//! first:
//!
//! - **Resident**: uncompressed in RAM, directly addressable
//! - **Compressed**: zstd-compressed in RAM
//! - **Disk**: in a single unlinked backing file
//!
//! Tier transitions run on a background worker thread when one is running
//! and inline otherwise. Touching a block through [`Block::get_pointer`]
//! brings its page back.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod transfer;

pub use cache::block::{Block, BlockData, Tier, TierStats};
pub use cache::book::Book;
pub use cache::page::{Page, PageId};
pub use config::Config;
pub use context::PagingContext;
pub use error::{PagingError, Result};
