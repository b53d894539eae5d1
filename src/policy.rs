//! Access policy: which endpoints may use the cache and the offline queue.

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::endpoint::EndpointKey;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  #[default]
  Free,
  Premium,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
  #[default]
  Active,
  Trial,
  Expired,
  Cancelled,
}

/// Subscription state the policy decisions are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionPolicy {
  pub tier: Tier,
  pub status: SubscriptionStatus,
  pub is_premium: bool,
  pub can_use_offline: bool,
}

impl SubscriptionPolicy {
  /// Derive the entitlements for a tier and status.
  ///
  /// Premium only counts while the subscription is active or in trial.
  pub fn new(tier: Tier, status: SubscriptionStatus) -> Self {
    let is_premium = tier == Tier::Premium
      && matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Trial);

    Self {
      tier,
      status,
      is_premium,
      can_use_offline: is_premium,
    }
  }

  pub fn free() -> Self {
    Self::new(Tier::Free, SubscriptionStatus::Active)
  }

  pub fn premium() -> Self {
    Self::new(Tier::Premium, SubscriptionStatus::Active)
  }
}

impl Default for SubscriptionPolicy {
  fn default() -> Self {
    Self::free()
  }
}

/// Strategy selected for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClassification {
  /// Auth and onboarding: network only, never cached or queued
  OnlineMandatory,
  /// No offline entitlement: network only, write-through cache on reads
  FreeEnforced,
  /// Cache-first reads, queued writes when the server is unreachable
  PremiumCapable,
}

pub const DEFAULT_MANDATORY_PREFIXES: &[&str] = &["/auth", "/onboarding"];

/// Static allow-list of endpoints that always require the network.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
  mandatory_prefixes: Vec<String>,
}

impl AccessPolicy {
  pub fn new<I, S>(prefixes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mandatory_prefixes = prefixes
      .into_iter()
      .map(|p| {
        let p = p.as_ref().trim().trim_end_matches('/');
        if p.starts_with('/') {
          p.to_string()
        } else {
          format!("/{}", p)
        }
      })
      .collect();

    Self { mandatory_prefixes }
  }

  /// Whether `endpoint` falls under a mandatory prefix.
  ///
  /// Prefixes match whole path segments: `/auth` covers `/auth` and
  /// `/auth/login` but not `/authors`.
  pub fn is_mandatory(&self, endpoint: &EndpointKey) -> bool {
    let path = endpoint.path();
    self.mandatory_prefixes.iter().any(|prefix| {
      path
        .strip_prefix(prefix.as_str())
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
  }

  pub fn classify(
    &self,
    endpoint: &EndpointKey,
    subscription: &SubscriptionPolicy,
  ) -> EndpointClassification {
    let classification = if self.is_mandatory(endpoint) {
      EndpointClassification::OnlineMandatory
    } else if subscription.is_premium && subscription.can_use_offline {
      EndpointClassification::PremiumCapable
    } else {
      EndpointClassification::FreeEnforced
    };

    debug!(%endpoint, ?classification, "classified endpoint");
    classification
  }
}

impl Default for AccessPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_MANDATORY_PREFIXES)
  }
}

/// Process-wide holder of the current subscription snapshot.
///
/// Last write wins; readers always see a complete snapshot.
#[derive(Clone)]
pub struct PolicyHandle {
  tx: watch::Sender<SubscriptionPolicy>,
}

impl PolicyHandle {
  pub fn new(initial: SubscriptionPolicy) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx }
  }

  pub fn snapshot(&self) -> SubscriptionPolicy {
    *self.tx.borrow()
  }

  pub fn replace(&self, policy: SubscriptionPolicy) {
    let previous = self.tx.send_replace(policy);
    if previous != policy {
      info!(tier = ?policy.tier, status = ?policy.status, "subscription policy updated");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<SubscriptionPolicy> {
    self.tx.subscribe()
  }

  /// Update from a profile response envelope if it carries a tier.
  ///
  /// Returns whether the snapshot was replaced.
  pub fn observe_profile(&self, body: &[u8]) -> bool {
    let Ok(envelope) = serde_json::from_slice::<ProfileEnvelope>(body) else {
      return false;
    };
    let Some(ProfileData {
      subscription_tier: Some(tier),
      subscription_status,
    }) = envelope.data
    else {
      return false;
    };

    self.replace(SubscriptionPolicy::new(tier, subscription_status.unwrap_or_default()));
    true
  }
}

impl Default for PolicyHandle {
  fn default() -> Self {
    Self::new(SubscriptionPolicy::default())
  }
}

#[derive(Deserialize)]
struct ProfileEnvelope {
  data: Option<ProfileData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileData {
  subscription_tier: Option<Tier>,
  subscription_status: Option<SubscriptionStatus>,
}
