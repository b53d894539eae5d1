//! Tiered offline-first data access for revalidation evidence tracking.
//!
//! Every request goes through the [`Gateway`], which asks the access policy
//! how to serve it:
//! - auth and onboarding endpoints always use the network
//! - free-tier users always use the network, with write-through caching
//! - premium users read from cache first and have unreachable writes queued
//!
//! The [`SyncCoordinator`] replays queued writes once connectivity returns.

pub mod cache;
pub mod config;
pub mod db;
pub mod endpoint;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod policy;
pub mod queue;
pub mod session;
pub mod sync;

#[cfg(test)]
mod testing;

pub use endpoint::EndpointKey;
pub use gateway::{Gateway, GatewayError, MutationOutcome, RefreshEvent};
pub use policy::{EndpointClassification, PolicyHandle, SubscriptionPolicy};
pub use sync::{DrainOutcome, DrainSummary, SyncCoordinator};
