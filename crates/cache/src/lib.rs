//! Disposable cache of artifacts derived from snapshots.
//!
//! The cache is never the source of truth. Every entry can be rebuilt
//! deterministically from the snapshot it was derived from, so deleting the
//! whole directory only costs time.

pub mod error;
mod manager;

pub use crate::manager::{CacheManager, CacheStats};
