use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::endpoint::EndpointKey;

/// Row id of a queued operation, assigned monotonically on insert.
pub type OpId = i64;

/// HTTP methods that mutate server state and may be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMethod {
  Post,
  Put,
  Patch,
  Delete,
}

impl MutationMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }
}

impl fmt::Display for MutationMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(format!("not a mutating method: {}", other)),
    }
  }
}

impl From<MutationMethod> for reqwest::Method {
  fn from(method: MutationMethod) -> Self {
    match method {
      MutationMethod::Post => reqwest::Method::POST,
      MutationMethod::Put => reqwest::Method::PUT,
      MutationMethod::Patch => reqwest::Method::PATCH,
      MutationMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Replay state of a queued operation.
///
/// `Pending -> Syncing -> {Synced (row deleted) | Failed (retry later) | deleted after cap}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
  Pending,
  Syncing,
  Synced,
  Failed,
}

impl OpStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Syncing => "syncing",
      Self::Synced => "synced",
      Self::Failed => "failed",
    }
  }
}

impl FromStr for OpStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "syncing" => Ok(Self::Syncing),
      "synced" => Ok(Self::Synced),
      "failed" => Ok(Self::Failed),
      other => Err(format!("unknown operation status: {}", other)),
    }
  }
}

/// A mutating request persisted for later replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
  pub id: OpId,
  pub method: MutationMethod,
  pub endpoint: EndpointKey,
  pub body: Option<Vec<u8>>,
  /// `Authorization` header value captured when the write was queued
  pub auth_header: Option<String>,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
  pub status: OpStatus,
}
