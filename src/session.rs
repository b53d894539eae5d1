use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::warn;

/// Current bearer token, shared between the gateway and whatever owns login.
///
/// The token may rotate at any time; queued writes capture the header value
/// in force when they were queued.
#[derive(Clone, Default)]
pub struct Session {
  token: Arc<RwLock<Option<String>>>,
}

impl Session {
  pub fn new(token: Option<String>) -> Self {
    Self {
      token: Arc::new(RwLock::new(token)),
    }
  }

  pub fn set_token(&self, token: impl Into<String>) {
    *self.write() = Some(token.into());
  }

  pub fn clear(&self) {
    *self.write() = None;
  }

  /// `Authorization` header value for the current token, if any.
  pub fn auth_header(&self) -> Option<String> {
    // The slot holds a plain value, so a panicked writer cannot leave it half-updated
    let guard = self.token.read().unwrap_or_else(PoisonError::into_inner);
    guard.as_ref().map(|t| format!("Bearer {}", t))
  }

  fn write(&self) -> RwLockWriteGuard<'_, Option<String>> {
    self.token.write().unwrap_or_else(|poisoned| {
      warn!("session lock poisoned by a panicked task, recovering");
      poisoned.into_inner()
    })
  }
}
