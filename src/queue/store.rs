//! SQLite-backed operation queue.
//!
//! Every write is committed before `enqueue` returns, so a queued operation
//! survives a crash. Rows left in `syncing` by an interrupted drain are put
//! back to `pending` by [`OperationQueue::recover_interrupted`], which gives
//! at-least-once replay.
//!
//! Several processes may share one database file. A single-row drain lease
//! decides which of them replays, and [`OperationQueue::claim`] moves a row to
//! `syncing` only if nobody else has.

use chrono::{TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{MutationMethod, OpId, OpStatus, QueuedOperation};
use crate::db::{Database, PoisonedLock};
use crate::endpoint::EndpointKey;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("queue storage error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error(transparent)]
  Lock(#[from] PoisonedLock),

  /// A row that cannot be decoded back into an operation.
  #[error("corrupt queue row {id}: {reason}")]
  Corrupt { id: OpId, reason: String },
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

/// Durable FIFO of mutating requests waiting to be replayed.
///
/// Clones share one lease identity; separately opened queues do not.
#[derive(Clone)]
pub struct OperationQueue {
  db: Database,
  owner: Arc<str>,
}

impl OperationQueue {
  /// Open the queue on `db`, recovering rows orphaned by a previous crash.
  pub fn open(db: Database) -> QueueResult<Self> {
    let owner = format!(
      "{}-{}",
      std::process::id(),
      NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
    );
    let queue = Self {
      db,
      owner: owner.into(),
    };
    queue.recover_interrupted()?;
    Ok(queue)
  }

  /// Persist a mutating request for later replay.
  ///
  /// Timestamps never go backwards, even across restarts or clock skew, so
  /// `enqueued_at` order is the order of calls.
  pub fn enqueue(
    &self,
    method: MutationMethod,
    endpoint: &EndpointKey,
    body: Option<&[u8]>,
    auth_header: Option<&str>,
  ) -> QueueResult<OpId> {
    let conn = self.db.lock()?;

    let last: i64 = conn.query_row(
      "SELECT COALESCE(MAX(enqueued_at), 0) FROM operation_queue",
      [],
      |row| row.get(0),
    )?;
    let enqueued_at = Utc::now().timestamp_millis().max(last + 1);

    conn.execute(
      "INSERT INTO operation_queue (method, endpoint, body, auth_header, enqueued_at, retry_count, status)
       VALUES (?, ?, ?, ?, ?, 0, ?)",
      params![
        method.as_str(),
        endpoint.request_target(),
        body,
        auth_header,
        enqueued_at,
        OpStatus::Pending.as_str()
      ],
    )?;
    let id = conn.last_insert_rowid();

    info!(id, %method, %endpoint, "queued operation for replay");
    Ok(id)
  }

  /// Operations eligible for replay (pending or failed), oldest first.
  pub fn list_pending(&self, limit: usize) -> QueueResult<Vec<QueuedOperation>> {
    let conn = self.db.lock()?;

    let mut stmt = conn.prepare(
      "SELECT id, method, endpoint, body, auth_header, enqueued_at, retry_count, status
       FROM operation_queue
       WHERE status IN ('pending', 'failed')
       ORDER BY enqueued_at ASC, id ASC
       LIMIT ?",
    )?;

    let ops = stmt
      .query_map(params![limit as i64], RawRow::from_row)?
      .map(|row| row.map_err(QueueError::from).and_then(RawRow::decode))
      .collect::<QueueResult<Vec<_>>>()?;

    Ok(ops)
  }

  /// Look up a single operation regardless of status.
  pub fn get(&self, id: OpId) -> QueueResult<Option<QueuedOperation>> {
    let conn = self.db.lock()?;

    let row = conn
      .query_row(
        "SELECT id, method, endpoint, body, auth_header, enqueued_at, retry_count, status
         FROM operation_queue WHERE id = ?",
        params![id],
        RawRow::from_row,
      )
      .optional()?;

    row.map(RawRow::decode).transpose()
  }

  /// Move an operation from `pending` or `failed` to `syncing`.
  ///
  /// Returns false when the row is gone or already being replayed, in which
  /// case the caller must not send it.
  pub fn claim(&self, id: OpId) -> QueueResult<bool> {
    let conn = self.db.lock()?;
    let claimed = conn.execute(
      "UPDATE operation_queue SET status = 'syncing'
       WHERE id = ? AND status IN ('pending', 'failed')",
      params![id],
    )?;
    Ok(claimed == 1)
  }

  /// Take the drain lease for `ttl`, or extend it if this queue already holds it.
  ///
  /// Returns false while another holder's lease is still live.
  pub fn try_acquire_lease(&self, ttl: Duration) -> QueueResult<bool> {
    let conn = self.db.lock()?;
    let now = Utc::now().timestamp_millis();
    let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

    let changed = conn.execute(
      "INSERT INTO drain_lease (id, owner, expires_at) VALUES (1, ?1, ?2)
       ON CONFLICT(id) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
       WHERE drain_lease.owner = excluded.owner OR drain_lease.expires_at <= ?3",
      params![&*self.owner, expires_at, now],
    )?;
    Ok(changed == 1)
  }

  /// Give the drain lease up if this queue holds it.
  pub fn release_lease(&self) -> QueueResult<()> {
    let conn = self.db.lock()?;
    conn.execute("DELETE FROM drain_lease WHERE owner = ?", params![&*self.owner])?;
    Ok(())
  }

  /// Update the status of an operation, and its retry count when given.
  pub fn mark_status(&self, id: OpId, status: OpStatus, retry_count: Option<u32>) -> QueueResult<()> {
    let conn = self.db.lock()?;

    match retry_count {
      Some(retries) => conn.execute(
        "UPDATE operation_queue SET status = ?, retry_count = ? WHERE id = ?",
        params![status.as_str(), retries, id],
      )?,
      None => conn.execute(
        "UPDATE operation_queue SET status = ? WHERE id = ?",
        params![status.as_str(), id],
      )?,
    };

    Ok(())
  }

  pub fn delete(&self, id: OpId) -> QueueResult<()> {
    let conn = self.db.lock()?;
    conn.execute("DELETE FROM operation_queue WHERE id = ?", params![id])?;
    Ok(())
  }

  /// Put every row stuck in `syncing` back to `pending`.
  ///
  /// Does nothing while another holder's drain lease is live, since its rows
  /// may still be in flight. Returns the number of recovered rows.
  pub fn recover_interrupted(&self) -> QueueResult<usize> {
    let conn = self.db.lock()?;
    let recovered = conn.execute(
      "UPDATE operation_queue SET status = 'pending'
       WHERE status = 'syncing'
         AND NOT EXISTS (
           SELECT 1 FROM drain_lease WHERE owner <> ?1 AND expires_at > ?2
         )",
      params![&*self.owner, Utc::now().timestamp_millis()],
    )?;

    if recovered > 0 {
      info!(recovered, "recovered interrupted operations");
    }
    Ok(recovered)
  }

  /// Number of operations still waiting to reach the server.
  pub fn pending_count(&self) -> QueueResult<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM operation_queue WHERE status IN ('pending', 'syncing', 'failed')",
      [],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  /// Drop every queued operation.
  pub fn clear_all(&self) -> QueueResult<usize> {
    let conn = self.db.lock()?;
    let removed = conn.execute("DELETE FROM operation_queue", [])?;
    debug!(removed, "cleared operation queue");
    Ok(removed)
  }
}

/// Column values as stored, before validation.
struct RawRow {
  id: OpId,
  method: String,
  endpoint: String,
  body: Option<Vec<u8>>,
  auth_header: Option<String>,
  enqueued_at: i64,
  retry_count: u32,
  status: String,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      method: row.get(1)?,
      endpoint: row.get(2)?,
      body: row.get(3)?,
      auth_header: row.get(4)?,
      enqueued_at: row.get(5)?,
      retry_count: row.get(6)?,
      status: row.get(7)?,
    })
  }

  fn decode(self) -> QueueResult<QueuedOperation> {
    let id = self.id;
    let corrupt = |reason: String| QueueError::Corrupt { id, reason };

    let method = self.method.parse::<MutationMethod>().map_err(corrupt)?;
    let status = self.status.parse::<OpStatus>().map_err(corrupt)?;
    let enqueued_at = Utc
      .timestamp_millis_opt(self.enqueued_at)
      .single()
      .ok_or_else(|| corrupt(format!("invalid timestamp {}", self.enqueued_at)))?;

    Ok(QueuedOperation {
      id,
      method,
      endpoint: EndpointKey::new(&self.endpoint),
      body: self.body,
      auth_header: self.auth_header,
      enqueued_at,
      retry_count: self.retry_count,
      status,
    })
  }
}
