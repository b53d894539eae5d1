//! Connectivity probe: point-in-time reachability checks plus change
//! notifications.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Reports whether the backend is reachable.
///
/// Being offline is a normal answer, not an error.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
  /// Perform a fresh reachability check.
  async fn is_online(&self) -> bool;

  /// Receiver that changes whenever a check observes a transition.
  fn subscribe(&self) -> watch::Receiver<bool>;

  /// Invoke `callback` on every connectivity transition until the returned
  /// subscription is cancelled or dropped.
  fn on_change(&self, callback: Box<dyn Fn(bool) + Send + Sync>) -> Subscription {
    let mut rx = self.subscribe();
    Subscription::from_handle(tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        callback(online);
      }
    }))
  }
}

/// Handle to a background listener; aborts the task when cancelled or dropped.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
  handle: JoinHandle<()>,
}

impl Subscription {
  pub fn from_handle(handle: JoinHandle<()>) -> Self {
    Self { handle }
  }

  pub fn cancel(self) {
    // Drop aborts
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Probe that issues a lightweight `HEAD` request against a health URL.
///
/// Any HTTP answer, whatever its status, means the server is reachable.
pub struct HttpProbe {
  http: reqwest::Client,
  check_url: String,
  state: watch::Sender<bool>,
}

impl HttpProbe {
  /// Starts out assuming offline, so the first successful check is reported
  /// as a transition.
  pub fn new(check_url: &str, timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;
    let (state, _rx) = watch::channel(false);

    Ok(Self {
      http,
      check_url: check_url.to_string(),
      state,
    })
  }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
  async fn is_online(&self) -> bool {
    let online = match self.http.head(&self.check_url).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(url = %self.check_url, error = %e, "reachability check failed");
        false
      }
    };

    let changed = self.state.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }

    online
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.state.subscribe()
  }
}

/// Background task that polls a probe so transitions are noticed without a
/// caller asking.
pub struct ProbeMonitor {
  handle: JoinHandle<()>,
}

impl ProbeMonitor {
  pub fn spawn(probe: Arc<dyn ConnectivityProbe>, interval: Duration) -> Self {
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        probe.is_online().await;
      }
    });

    Self { handle }
  }

  /// Stop polling.
  pub fn shutdown(self) {
    // Drop aborts
  }
}

impl Drop for ProbeMonitor {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
