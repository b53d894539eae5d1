//! Canonical endpoint keys shared by the cache, the queue and the policy engine.

use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use url::form_urlencoded;

/// An API path plus query, in two forms.
///
/// The canonical form identifies the resource: a leading `/` is enforced,
/// query parameters are sorted by name (ties keep their original order) and
/// an empty query is dropped, so two spellings of the same request share a
/// key. The request target is what the caller wrote, with only the leading
/// `/` added, and is what goes on the wire.
///
/// Equality and hashing use the canonical form only.
#[derive(Debug, Clone)]
pub struct EndpointKey {
  canonical: String,
  target: String,
}

impl EndpointKey {
  pub fn new(raw: &str) -> Self {
    let raw = raw.trim();
    let (path, query) = match raw.split_once('?') {
      Some((path, query)) => (path, Some(query)),
      None => (raw, None),
    };

    let mut canonical = String::with_capacity(raw.len() + 1);
    if !path.starts_with('/') {
      canonical.push('/');
    }
    canonical.push_str(path);
    let mut target = canonical.clone();

    if let Some(query) = query.filter(|q| !q.is_empty()) {
      target.push('?');
      target.push_str(query);

      let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
      if !pairs.is_empty() {
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let encoded = form_urlencoded::Serializer::new(String::new())
          .extend_pairs(pairs)
          .finish();
        canonical.push('?');
        canonical.push_str(&encoded);
      }
    }

    Self { canonical, target }
  }

  /// Canonical form.
  pub fn as_str(&self) -> &str {
    &self.canonical
  }

  /// Path and query exactly as requested.
  pub fn request_target(&self) -> &str {
    &self.target
  }

  /// The path component without the query string.
  pub fn path(&self) -> &str {
    self
      .canonical
      .split_once('?')
      .map(|(p, _)| p)
      .unwrap_or(&self.canonical)
  }

  /// Stable fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl PartialEq for EndpointKey {
  fn eq(&self, other: &Self) -> bool {
    self.canonical == other.canonical
  }
}

impl Eq for EndpointKey {}

impl Hash for EndpointKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.canonical.hash(state);
  }
}

impl fmt::Display for EndpointKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

impl From<&str> for EndpointKey {
  fn from(raw: &str) -> Self {
    Self::new(raw)
  }
}

impl From<String> for EndpointKey {
  fn from(raw: String) -> Self {
    Self::new(&raw)
  }
}
