//! Best-effort cache facade used by the request gateway.

use std::sync::Arc;
use tracing::warn;

use super::storage::CacheStorage;
use super::traits::CacheEntry;
use crate::endpoint::EndpointKey;

/// Cache layer that never fails.
///
/// The cache is an optimisation, never a source of truth: storage errors are
/// logged and reported to callers as a miss (reads) or ignored (writes).
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn get(&self, key: &EndpointKey) -> Option<CacheEntry> {
    match self.storage.get(key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(endpoint = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  pub fn set(&self, key: &EndpointKey, payload: &[u8]) {
    if let Err(e) = self.storage.set(key, payload) {
      warn!(endpoint = %key, error = %e, "cache write failed");
    }
  }

  pub fn clear_all(&self) {
    if let Err(e) = self.storage.clear_all() {
      warn!(error = %e, "cache clear failed");
    }
  }

  /// Number of cached endpoints, zero if the store cannot be read.
  pub fn len(&self) -> usize {
    self.storage.len().unwrap_or_else(|e| {
      warn!(error = %e, "cache count failed");
      0
    })
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
