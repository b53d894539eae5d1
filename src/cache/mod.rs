//! Durable response cache for offline reads.
//!
//! This module provides the read-side half of offline support:
//! - One entry per canonical endpoint, overwritten on every successful read
//! - No expiry; stale entries are corrected by background refresh
//! - Storage failures degrade to cache misses instead of user-facing errors

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage, StoreError, StoreResult};
pub use traits::{CacheEntry, CacheResult, CacheSource};
