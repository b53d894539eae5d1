//! Core types for the response cache.

use chrono::{DateTime, Utc};

use crate::endpoint::EndpointKey;

/// Last known response body for one read endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: EndpointKey,
  pub payload: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

/// Result of a read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Set only for cache hits
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Wrap a stored payload along with the time it was written.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where read data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched just now
  Network,
  /// Last known value from the local cache; a background refresh is running
  Cache,
}
