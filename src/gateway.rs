//! Request gateway: routes every read and write through the network, the
//! cache or the offline queue according to the access policy.
//!
//! Reads:
//! - online-mandatory and free-enforced endpoints always go to the network
//! - premium endpoints answer from cache when possible and refresh in the
//!   background
//!
//! Writes always try the network first. Only a premium write that could not
//! reach the server is queued; a server rejection is never queued.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult};
use crate::endpoint::EndpointKey;
use crate::net::{ApiRequest, ApiResponse, ConnectivityProbe, NetworkError, Transport};
use crate::policy::{AccessPolicy, EndpointClassification, PolicyHandle};
use crate::queue::{MutationMethod, OpId, OperationQueue, QueueError, QueuedOperation};
use crate::session::Session;

pub const DEFAULT_PROFILE_ENDPOINT: &str = "/users/profile";

/// Error returned to gateway callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
  /// The server was reached and rejected the request.
  #[error("server rejected request ({status}): {message}")]
  Server { status: u16, message: String },

  /// The device is offline and this request cannot be served without the network.
  #[error("an internet connection is required for this action")]
  ConnectivityRequired,

  /// The server was not reached although the device appears to be online.
  #[error("network request failed: {0}")]
  TransientNetwork(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// The offline queue could not persist a write.
  #[error("failed to save change for later sync: {0}")]
  QueuePersistence(#[from] QueueError),
}

impl GatewayError {
  /// 401/403: the caller must re-authenticate.
  pub fn is_auth_failure(&self) -> bool {
    matches!(self, Self::Server { status: 401 | 403, .. })
  }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The server accepted the write; its response is returned verbatim.
  Completed(ApiResponse),
  /// The server was unreachable and the write was queued for replay.
  Queued { op_id: OpId },
}

impl MutationOutcome {
  /// Response body to hand to the UI; queued writes get a synthetic
  /// success envelope so the UI can proceed optimistically.
  pub fn body(&self) -> Vec<u8> {
    match self {
      Self::Completed(response) => response.body.clone(),
      Self::Queued { op_id } => json!({
        "success": true,
        "queued": true,
        "operationId": op_id,
        "message": "Saved offline. It will sync when you are back online.",
        "data": null,
      })
      .to_string()
      .into_bytes(),
    }
  }
}

/// Outcome of a background cache refresh.
#[derive(Debug, Clone)]
pub struct RefreshEvent {
  pub endpoint: EndpointKey,
  pub result: Result<(), NetworkError>,
}

/// Entry point for every API call made by the UI.
#[derive(Clone)]
pub struct Gateway {
  transport: Arc<dyn Transport>,
  probe: Arc<dyn ConnectivityProbe>,
  cache: CacheLayer,
  queue: OperationQueue,
  access: AccessPolicy,
  policy: PolicyHandle,
  session: Session,
  profile_endpoint: EndpointKey,
  refresh_tx: broadcast::Sender<RefreshEvent>,
}

impl Gateway {
  pub fn new(
    transport: Arc<dyn Transport>,
    probe: Arc<dyn ConnectivityProbe>,
    cache: CacheLayer,
    queue: OperationQueue,
    policy: PolicyHandle,
    session: Session,
  ) -> Self {
    let (refresh_tx, _rx) = broadcast::channel(64);

    Self {
      transport,
      probe,
      cache,
      queue,
      access: AccessPolicy::default(),
      policy,
      session,
      profile_endpoint: EndpointKey::new(DEFAULT_PROFILE_ENDPOINT),
      refresh_tx,
    }
  }

  pub fn with_access_policy(mut self, access: AccessPolicy) -> Self {
    self.access = access;
    self
  }

  /// Endpoint whose responses carry the subscription tier.
  pub fn with_profile_endpoint(mut self, endpoint: &str) -> Self {
    self.profile_endpoint = EndpointKey::new(endpoint);
    self
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn queue(&self) -> &OperationQueue {
    &self.queue
  }

  pub fn probe(&self) -> &Arc<dyn ConnectivityProbe> {
    &self.probe
  }

  pub fn policy(&self) -> &PolicyHandle {
    &self.policy
  }

  /// Background refresh outcomes, for observers that care.
  pub fn refresh_events(&self) -> broadcast::Receiver<RefreshEvent> {
    self.refresh_tx.subscribe()
  }

  pub fn classify(&self, endpoint: &EndpointKey) -> EndpointClassification {
    self.access.classify(endpoint, &self.policy.snapshot())
  }

  /// Read an endpoint.
  pub async fn get(
    &self,
    endpoint: impl Into<EndpointKey>,
  ) -> Result<CacheResult<Vec<u8>>, GatewayError> {
    let endpoint = endpoint.into();
    let classification = self.classify(&endpoint);

    if classification == EndpointClassification::PremiumCapable {
      if let Some(entry) = self.cache.get(&endpoint) {
        debug!(%endpoint, "serving cached response");
        self.spawn_refresh(endpoint);
        return Ok(CacheResult::from_cache(entry.payload, entry.stored_at));
      }
    }

    let response = match self.fetch(&endpoint).await {
      Ok(response) => response,
      Err(e) => return Err(self.classify_failure(e).await),
    };

    if classification != EndpointClassification::OnlineMandatory {
      self.cache.set(&endpoint, &response.body);
    }

    Ok(CacheResult::from_network(response.body))
  }

  /// Send a mutating request, queueing it when allowed and the server is unreachable.
  pub async fn mutate(
    &self,
    method: MutationMethod,
    endpoint: impl Into<EndpointKey>,
    body: Option<Vec<u8>>,
  ) -> Result<MutationOutcome, GatewayError> {
    let endpoint = endpoint.into();
    let classification = self.classify(&endpoint);
    let request = ApiRequest::mutation(method, endpoint, body, self.session.auth_header());

    match self.transport.send(&request).await {
      Ok(response) => Ok(MutationOutcome::Completed(response)),
      Err(NetworkError::Unreachable(reason))
        if classification == EndpointClassification::PremiumCapable =>
      {
        // The token may have rotated while the request was in flight
        let auth_header = self.session.auth_header();
        let op_id = self.queue.enqueue(
          method,
          &request.endpoint,
          request.body.as_deref(),
          auth_header.as_deref(),
        )?;
        info!(op_id, endpoint = %request.endpoint, %reason, "server unreachable, write queued");
        Ok(MutationOutcome::Queued { op_id })
      }
      Err(e) => Err(self.classify_failure(e).await),
    }
  }

  /// Send a queued operation exactly as it was captured.
  ///
  /// Bypasses the policy, the cache and the queue.
  pub async fn replay(&self, op: &QueuedOperation) -> Result<ApiResponse, NetworkError> {
    let request = ApiRequest::mutation(
      op.method,
      op.endpoint.clone(),
      op.body.clone(),
      op.auth_header.clone(),
    );
    self.transport.send(&request).await
  }

  async fn fetch(&self, endpoint: &EndpointKey) -> Result<ApiResponse, NetworkError> {
    let request = ApiRequest::get(endpoint.clone(), self.session.auth_header());
    let response = self.transport.send(&request).await?;

    if endpoint.path() == self.profile_endpoint.path() {
      self.policy.observe_profile(&response.body);
    }

    Ok(response)
  }

  /// Turn a foreground network failure into the caller-facing error.
  ///
  /// Only an unreached server triggers a connectivity re-check; a server that
  /// answered with an error is reported as such.
  async fn classify_failure(&self, error: NetworkError) -> GatewayError {
    match error {
      NetworkError::Server { status, message } => GatewayError::Server { status, message },
      NetworkError::Invalid(reason) => GatewayError::InvalidRequest(reason),
      NetworkError::Unreachable(reason) => {
        if self.probe.is_online().await {
          GatewayError::TransientNetwork(reason)
        } else {
          GatewayError::ConnectivityRequired
        }
      }
    }
  }

  fn spawn_refresh(&self, endpoint: EndpointKey) {
    let gateway = self.clone();

    tokio::spawn(async move {
      let result = match gateway.fetch(&endpoint).await {
        Ok(response) => {
          gateway.cache.set(&endpoint, &response.body);
          debug!(%endpoint, "background refresh updated cache");
          Ok(())
        }
        Err(e) => {
          warn!(%endpoint, error = %e, "background refresh failed");
          Err(e)
        }
      };

      // No subscribers is fine
      let _ = gateway.refresh_tx.send(RefreshEvent { endpoint, result });
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::policy::{SubscriptionPolicy, Tier};
  use crate::queue::OpStatus;
  use crate::testing::{ManualProbe, ScriptedTransport};
  use std::time::Duration;

  struct Harness {
    gateway: Gateway,
    transport: Arc<ScriptedTransport>,
    probe: Arc<ManualProbe>,
    db: Database,
  }

  fn harness(subscription: SubscriptionPolicy, online: bool) -> Harness {
    harness_with(ScriptedTransport::new(), subscription, online)
  }

  fn harness_with(
    transport: ScriptedTransport,
    subscription: SubscriptionPolicy,
    online: bool,
  ) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let transport = Arc::new(transport);
    let probe = Arc::new(ManualProbe::new(online));
    let gateway = Gateway::new(
      transport.clone(),
      probe.clone(),
      CacheLayer::new(SqliteStorage::new(db.clone())),
      OperationQueue::open(db.clone()).unwrap(),
      PolicyHandle::new(subscription),
      Session::new(Some("tok".into())),
    );

    Harness {
      gateway,
      transport,
      probe,
      db,
    }
  }

  fn key(s: &str) -> EndpointKey {
    EndpointKey::new(s)
  }

  #[tokio::test]
  async fn test_mandatory_endpoints_never_use_cache_or_queue() {
    for subscription in [SubscriptionPolicy::free(), SubscriptionPolicy::premium()] {
      let h = harness(subscription, false);
      h.gateway.cache().set(&key("/auth/me"), b"stale identity");
      h.transport.respond_ok(r#"{"success":true,"data":{"id":1}}"#);

      let result = h.gateway.get("/auth/me").await.unwrap();
      assert_eq!(result.source, CacheSource::Network);
      assert_eq!(
        h.gateway.cache().get(&key("/auth/me")).unwrap().payload,
        b"stale identity"
      );

      h.transport.respond_unreachable();
      let err = h
        .gateway
        .mutate(MutationMethod::Post, "/onboarding/complete", Some(b"{}".to_vec()))
        .await
        .unwrap_err();
      assert!(matches!(err, GatewayError::ConnectivityRequired));
      assert_eq!(h.gateway.queue().pending_count().unwrap(), 0);
    }
  }

  #[tokio::test]
  async fn test_mandatory_read_failure_offline_is_connectivity_required() {
    let h = harness(SubscriptionPolicy::premium(), false);
    h.gateway.cache().set(&key("/auth/me"), b"cached");
    h.transport.respond_unreachable();

    let err = h.gateway.get("/auth/me").await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectivityRequired));
  }

  #[tokio::test]
  async fn test_free_read_offline_is_connectivity_required() {
    let h = harness(SubscriptionPolicy::free(), false);
    h.gateway.cache().set(&key("/work-hours"), b"cached hours");
    h.transport.respond_unreachable();

    let err = h.gateway.get("/work-hours").await.unwrap_err();

    assert!(matches!(err, GatewayError::ConnectivityRequired));
    assert_eq!(h.transport.sent_count(), 1);
    assert_eq!(h.gateway.queue().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_free_read_unreached_but_online_is_transient() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.transport.respond_unreachable();

    let err = h.gateway.get("/work-hours").await.unwrap_err();
    assert!(matches!(err, GatewayError::TransientNetwork(_)));
  }

  #[tokio::test]
  async fn test_free_read_server_error_propagates_untouched() {
    for online in [true, false] {
      let h = harness(SubscriptionPolicy::free(), online);
      h.transport.respond_server_error(500, "database down");

      let err = h.gateway.get("/work-hours").await.unwrap_err();
      match err {
        GatewayError::Server { status, message } => {
          assert_eq!(status, 500);
          assert_eq!(message, "database down");
        }
        other => panic!("expected server error, got {:?}", other),
      }
      // A reachable server is never second-guessed by the probe
      assert_eq!(h.probe.checks(), 0);
    }
  }

  #[tokio::test]
  async fn test_free_read_writes_through_cache() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.transport.respond_ok("fresh");

    let result = h.gateway.get("/feedback").await.unwrap();

    assert_eq!(result.data, b"fresh");
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(h.gateway.cache().get(&key("/feedback")).unwrap().payload, b"fresh");
  }

  #[tokio::test]
  async fn test_free_read_ignores_existing_cache() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.gateway.cache().set(&key("/feedback"), b"old");
    h.transport.respond_ok("new");

    let result = h.gateway.get("/feedback").await.unwrap();
    assert_eq!(result.data, b"new");
    assert_eq!(h.transport.sent_count(), 1);
  }

  #[tokio::test]
  async fn test_premium_cache_hit_returns_immediately_and_refreshes_once() {
    let transport = ScriptedTransport::new().with_delay(Duration::from_millis(200));
    let h = harness_with(transport, SubscriptionPolicy::premium(), true);
    h.gateway.cache().set(&key("/cpd-hours"), b"cached");
    h.transport.respond_ok("refreshed");
    let mut events = h.gateway.refresh_events();

    let result = tokio::time::timeout(Duration::from_millis(50), h.gateway.get("/cpd-hours"))
      .await
      .expect("cache hit must not wait for the network")
      .unwrap();

    assert_eq!(result.data, b"cached");
    assert_eq!(result.source, CacheSource::Cache);
    assert!(result.cached_at.is_some());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event.endpoint, key("/cpd-hours"));
    assert!(event.result.is_ok());
    assert_eq!(h.transport.sent_count(), 1);
    assert_eq!(h.gateway.cache().get(&key("/cpd-hours")).unwrap().payload, b"refreshed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_premium_refresh_failure_is_swallowed() {
    let h = harness(SubscriptionPolicy::premium(), false);
    h.gateway.cache().set(&key("/reflections"), b"cached");
    h.transport.respond_server_error(500, "boom");
    let mut events = h.gateway.refresh_events();

    let result = h.gateway.get("/reflections").await.unwrap();
    assert_eq!(result.data, b"cached");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(event.result, Err(NetworkError::Server { status: 500, .. })));
    assert_eq!(h.gateway.cache().get(&key("/reflections")).unwrap().payload, b"cached");
  }

  #[tokio::test]
  async fn test_premium_cache_miss_waits_for_network() {
    let h = harness(SubscriptionPolicy::premium(), true);
    h.transport.respond_ok("from server");

    let result = h.gateway.get("/appraisals").await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data, b"from server");
    assert_eq!(h.gateway.cache().get(&key("/appraisals")).unwrap().payload, b"from server");
  }

  #[tokio::test]
  async fn test_premium_cache_miss_offline_is_connectivity_required() {
    let h = harness(SubscriptionPolicy::premium(), false);
    h.transport.respond_unreachable();

    let err = h.gateway.get("/appraisals").await.unwrap_err();
    assert!(matches!(err, GatewayError::ConnectivityRequired));
  }

  #[tokio::test]
  async fn test_cache_storage_failure_never_surfaces() {
    let h = harness(SubscriptionPolicy::premium(), true);
    h.db
      .lock()
      .unwrap()
      .execute_batch("DROP TABLE response_cache")
      .unwrap();
    h.transport.respond_ok("fresh");

    let result = h.gateway.get("/work-hours").await.unwrap();
    assert_eq!(result.data, b"fresh");
  }

  #[tokio::test]
  async fn test_write_success_returned_verbatim() {
    let h = harness(SubscriptionPolicy::premium(), true);
    h.transport.respond(Ok(ApiResponse {
      status: 201,
      body: br#"{"success":true,"data":{"id":9}}"#.to_vec(),
    }));

    let outcome = h
      .gateway
      .mutate(MutationMethod::Post, "/cpd-hours", Some(b"{}".to_vec()))
      .await
      .unwrap();

    assert_eq!(
      outcome,
      MutationOutcome::Completed(ApiResponse {
        status: 201,
        body: br#"{"success":true,"data":{"id":9}}"#.to_vec(),
      })
    );
    assert_eq!(h.gateway.queue().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_premium_offline_write_is_queued() {
    let h = harness(SubscriptionPolicy::premium(), false);
    h.transport.respond_unreachable();
    let body = br#"{"trainingName":"CPR"}"#.to_vec();

    let outcome = h
      .gateway
      .mutate(MutationMethod::Post, "/cpd-hours", Some(body.clone()))
      .await
      .unwrap();

    let MutationOutcome::Queued { op_id } = outcome else {
      panic!("expected queued outcome, got {:?}", outcome);
    };
    let synthetic: serde_json::Value = serde_json::from_slice(&outcome.body()).unwrap();
    assert_eq!(synthetic["success"], true);
    assert_eq!(synthetic["queued"], true);

    let ops = h.gateway.queue().list_pending(50).unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].id, op_id);
    assert_eq!(ops[0].status, OpStatus::Pending);
    assert_eq!(ops[0].method, MutationMethod::Post);
    assert_eq!(ops[0].endpoint, key("/cpd-hours"));
    assert_eq!(ops[0].body.as_deref(), Some(&body[..]));
    assert_eq!(ops[0].auth_header.as_deref(), Some("Bearer tok"));
    // A queued write never touches the cache
    assert!(h.gateway.cache().is_empty());
  }

  #[tokio::test]
  async fn test_premium_server_rejection_is_not_queued() {
    let h = harness(SubscriptionPolicy::premium(), true);
    h.transport.respond_server_error(422, "invalid hours");

    let err = h
      .gateway
      .mutate(MutationMethod::Put, "/work-hours/3", Some(b"{}".to_vec()))
      .await
      .unwrap_err();

    assert!(matches!(err, GatewayError::Server { status: 422, .. }));
    assert_eq!(h.gateway.queue().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_free_write_unreached_is_never_queued() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.transport.respond_unreachable();
    let err = h
      .gateway
      .mutate(MutationMethod::Post, "/cpd-hours", None)
      .await
      .unwrap_err();
    assert!(matches!(err, GatewayError::TransientNetwork(_)));

    h.probe.set_online(false);
    h.transport.respond_unreachable();
    let err = h
      .gateway
      .mutate(MutationMethod::Post, "/cpd-hours", None)
      .await
      .unwrap_err();
    assert!(matches!(err, GatewayError::ConnectivityRequired));

    assert_eq!(h.gateway.queue().pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_queue_failure_surfaces_as_persistence_error() {
    let h = harness(SubscriptionPolicy::premium(), false);
    h.db
      .lock()
      .unwrap()
      .execute_batch("DROP TABLE operation_queue")
      .unwrap();
    h.transport.respond_unreachable();

    let err = h
      .gateway
      .mutate(MutationMethod::Delete, "/feedback/4", None)
      .await
      .unwrap_err();
    assert!(matches!(err, GatewayError::QueuePersistence(_)));
  }

  #[tokio::test]
  async fn test_auth_failure_is_flagged() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.transport.respond_server_error(401, "token expired");

    let err = h.gateway.get("/work-hours").await.unwrap_err();
    assert!(err.is_auth_failure());
  }

  #[tokio::test]
  async fn test_profile_response_updates_subscription() {
    let h = harness(SubscriptionPolicy::free(), true);
    h.transport
      .respond_ok(r#"{"success":true,"data":{"subscriptionTier":"premium","subscriptionStatus":"active"}}"#);

    h.gateway.get("/users/profile").await.unwrap();

    assert_eq!(h.gateway.policy().snapshot().tier, Tier::Premium);
    assert_eq!(
      h.gateway.classify(&key("/work-hours")),
      EndpointClassification::PremiumCapable
    );
  }

  #[tokio::test]
  async fn test_replay_uses_captured_auth() {
    let h = harness(SubscriptionPolicy::premium(), true);
    let op_id = h
      .gateway
      .queue()
      .enqueue(
        MutationMethod::Patch,
        &key("/reflections/2"),
        Some(b"{\"x\":1}"),
        Some("Bearer old"),
      )
      .unwrap();
    let op = h.gateway.queue().get(op_id).unwrap().unwrap();
    h.transport.respond_ok("{}");

    h.gateway.replay(&op).await.unwrap();

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, reqwest::Method::PATCH);
    assert_eq!(sent[0].auth_header.as_deref(), Some("Bearer old"));
    assert_eq!(sent[0].body.as_deref(), Some(&b"{\"x\":1}"[..]));
  }
}
