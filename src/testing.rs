//! Shared test doubles for the gateway and reconciler tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::net::{ApiRequest, ApiResponse, ConnectivityProbe, NetworkError, Transport};

/// Probe whose answer is set by the test.
pub struct ManualProbe {
  online: AtomicBool,
  checks: AtomicUsize,
  state: watch::Sender<bool>,
}

impl ManualProbe {
  pub fn new(online: bool) -> Self {
    let (state, _rx) = watch::channel(online);
    Self {
      online: AtomicBool::new(online),
      checks: AtomicUsize::new(0),
      state,
    }
  }

  /// Flip connectivity and notify subscribers.
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
    self.state.send_replace(online);
  }

  /// Number of `is_online` calls so far.
  pub fn checks(&self) -> usize {
    self.checks.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
  async fn is_online(&self) -> bool {
    self.checks.fetch_add(1, Ordering::SeqCst);
    self.online.load(Ordering::SeqCst)
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }
}

/// Transport that answers from a script and records every request.
///
/// Once the script runs out every request fails as unreachable.
pub struct ScriptedTransport {
  script: Mutex<VecDeque<Result<ApiResponse, NetworkError>>>,
  sent: Mutex<Vec<ApiRequest>>,
  delay: Duration,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      sent: Mutex::new(Vec::new()),
      delay: Duration::ZERO,
    }
  }

  /// Sleep this long before answering each request.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn respond(&self, result: Result<ApiResponse, NetworkError>) -> &Self {
    self.script.lock().unwrap().push_back(result);
    self
  }

  pub fn respond_ok(&self, body: &str) -> &Self {
    self.respond(Ok(ApiResponse::ok(body)))
  }

  pub fn respond_server_error(&self, status: u16, message: &str) -> &Self {
    self.respond(Err(NetworkError::Server {
      status,
      message: message.to_string(),
    }))
  }

  pub fn respond_unreachable(&self) -> &Self {
    self.respond(Err(unreachable()))
  }

  pub fn sent(&self) -> Vec<ApiRequest> {
    self.sent.lock().unwrap().clone()
  }

  pub fn sent_count(&self) -> usize {
    self.sent.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, NetworkError> {
    self.sent.lock().unwrap().push(request.clone());
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    let next = self.script.lock().unwrap().pop_front();
    next.unwrap_or_else(|| Err(unreachable()))
  }
}

fn unreachable() -> NetworkError {
  NetworkError::Unreachable("connection refused".into())
}
