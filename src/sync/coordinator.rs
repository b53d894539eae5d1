//! Sync coordinator: drains the operation queue when connectivity returns.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::gateway::Gateway;
use crate::net::{ConnectivityProbe, NetworkError, Subscription};
use crate::queue::{
  MutationMethod, OpId, OpStatus, OperationQueue, QueueResult, QueuedOperation,
};

/// Configuration for drain passes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
  /// Failed replay attempts after which an operation is dropped.
  pub max_retries: u32,
  /// Maximum operations replayed per drain pass.
  pub page_size: usize,
  /// How long the cross-process drain lease lasts without renewal. Must
  /// outlive one request.
  pub lease_ttl: Duration,
}

impl Default for SyncConfig {
  fn default() -> Self {
    SyncConfig {
      max_retries: 3,
      page_size: 50,
      lease_ttl: Duration::from_secs(60),
    }
  }
}

/// An operation dropped from the queue without reaching the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedOperation {
  pub id: OpId,
  pub method: MutationMethod,
  pub endpoint: String,
  pub reason: String,
}

/// Aggregate result of one drain pass, published once per pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
  pub synced: usize,
  /// Operations that will be tried again on a later pass.
  pub retried: usize,
  pub failed: Vec<FailedOperation>,
}

impl DrainSummary {
  pub fn permanently_failed(&self) -> usize {
    self.failed.len()
  }

  pub fn attempted(&self) -> usize {
    self.synced + self.retried + self.failed.len()
  }
}

impl fmt::Display for DrainSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} synced", self.synced)?;
    if !self.failed.is_empty() {
      write!(f, ", {} failed permanently", self.failed.len())?;
    }
    if self.retried > 0 {
      write!(f, ", {} waiting to retry", self.retried)?;
    }
    Ok(())
  }
}

/// What a call to [`SyncCoordinator::drain`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// Another pass was already running in this or another process; this call
  /// did nothing.
  AlreadyRunning,
  /// The probe reported offline; nothing was touched.
  Offline,
  Completed(DrainSummary),
}

/// Owns the single "is draining" flag for the process.
///
/// Construct once at startup and share by `Arc`.
pub struct SyncCoordinator {
  gateway: Gateway,
  queue: OperationQueue,
  probe: Arc<dyn ConnectivityProbe>,
  config: SyncConfig,
  draining: AtomicBool,
  summaries: broadcast::Sender<DrainSummary>,
}

impl SyncCoordinator {
  pub fn new(gateway: Gateway, config: SyncConfig) -> Self {
    let (summaries, _rx) = broadcast::channel(16);

    Self {
      queue: gateway.queue().clone(),
      probe: Arc::clone(gateway.probe()),
      gateway,
      config,
      draining: AtomicBool::new(false),
      summaries,
    }
  }

  /// Post-drain summaries, one per pass that replayed anything.
  pub fn summaries(&self) -> broadcast::Receiver<DrainSummary> {
    self.summaries.subscribe()
  }

  /// Operations not yet accepted by the server, for a "N changes waiting" indicator.
  pub fn pending_count(&self) -> QueueResult<usize> {
    self.queue.pending_count()
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Run one drain pass over the queue.
  ///
  /// Operations are replayed oldest first. Accepted operations are deleted;
  /// rejected ones are deleted and reported; unreached ones are retried on a
  /// later pass until `max_retries` attempts have failed.
  pub async fn drain(&self) -> QueueResult<DrainOutcome> {
    // Taken before the first await so a concurrent trigger always sees it
    let Some(_guard) = DrainGuard::acquire(&self.draining) else {
      debug!("drain already running, ignoring trigger");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    if !self.probe.is_online().await {
      debug!("offline, skipping drain");
      return Ok(DrainOutcome::Offline);
    }

    let Some(_lease) = DrainLease::acquire(&self.queue, self.config.lease_ttl)? else {
      debug!("another process is draining, ignoring trigger");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    // Safe under the lease: no other drain can have rows in flight
    self.queue.recover_interrupted()?;
    let ops = self.queue.list_pending(self.config.page_size)?;
    debug!(count = ops.len(), "starting drain pass");

    let mut summary = DrainSummary::default();
    let mut result = Ok(());
    for op in &ops {
      let step = match self.queue.try_acquire_lease(self.config.lease_ttl) {
        Ok(true) => self.replay_one(op, &mut summary).await,
        Ok(false) => {
          warn!("drain lease taken over, stopping pass");
          break;
        }
        Err(e) => Err(e),
      };
      if let Err(e) = step {
        warn!(op_id = op.id, error = %e, "queue storage failed, aborting drain pass");
        result = Err(e);
        break;
      }
    }

    if summary.attempted() > 0 {
      info!(
        synced = summary.synced,
        failed = summary.permanently_failed(),
        retried = summary.retried,
        "drain pass finished"
      );
      // No subscribers is fine
      let _ = self.summaries.send(summary.clone());
    }

    result.map(|()| DrainOutcome::Completed(summary))
  }

  async fn replay_one(&self, op: &QueuedOperation, summary: &mut DrainSummary) -> QueueResult<()> {
    if !self.queue.claim(op.id)? {
      debug!(op_id = op.id, "operation already claimed, skipping");
      return Ok(());
    }

    match self.gateway.replay(op).await {
      Ok(_) => {
        self.queue.delete(op.id)?;
        debug!(op_id = op.id, endpoint = %op.endpoint, "operation synced");
        summary.synced += 1;
      }
      Err(NetworkError::Unreachable(reason)) => {
        let retries = op.retry_count + 1;
        if retries >= self.config.max_retries {
          self.queue.delete(op.id)?;
          warn!(op_id = op.id, retries, %reason, "operation dropped after retry cap");
          summary.failed.push(FailedOperation::new(op, reason));
        } else {
          self.queue.mark_status(op.id, OpStatus::Failed, Some(retries))?;
          debug!(op_id = op.id, retries, %reason, "operation will be retried");
          summary.retried += 1;
        }
      }
      Err(e) => {
        // Replaying a rejected request would only repeat the rejection
        self.queue.delete(op.id)?;
        warn!(op_id = op.id, error = %e, "operation rejected by server");
        summary.failed.push(FailedOperation::new(op, e.to_string()));
      }
    }

    Ok(())
  }

  /// Start a drain on every transition to online.
  ///
  /// Each trigger runs as its own task, so a trigger that arrives mid-drain
  /// hits the guard and does nothing.
  pub fn spawn_auto_sync(self: &Arc<Self>) -> Subscription {
    let coordinator = Arc::clone(self);
    let mut rx = self.probe.subscribe();

    Subscription::from_handle(tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !online {
          continue;
        }

        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
          if let Err(e) = coordinator.drain().await {
            warn!(error = %e, "automatic drain failed");
          }
        });
      }
    }))
  }
}

impl FailedOperation {
  fn new(op: &QueuedOperation, reason: String) -> Self {
    Self {
      id: op.id,
      method: op.method,
      endpoint: op.endpoint.to_string(),
      reason,
    }
  }
}

/// Holds the draining flag; clearing happens on drop so an error or panic
/// mid-pass cannot wedge future drains.
struct DrainGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}

/// Cross-process drain lease, released on drop.
struct DrainLease<'a> {
  queue: &'a OperationQueue,
}

impl<'a> DrainLease<'a> {
  fn acquire(queue: &'a OperationQueue, ttl: Duration) -> QueueResult<Option<Self>> {
    Ok(queue.try_acquire_lease(ttl)?.then_some(Self { queue }))
  }
}

impl Drop for DrainLease<'_> {
  fn drop(&mut self) {
    if let Err(e) = self.queue.release_lease() {
      // Expiry frees it eventually
      warn!(error = %e, "failed to release drain lease");
    }
  }
}
