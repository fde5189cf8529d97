//! Moving pages out of RAM and back.
//!
//! - [`backing_store`]: positional I/O into the unlinked backing file
//! - [`coordinator`]: background worker with read/write queues

pub mod backing_store;
pub mod coordinator;
