//! Network plumbing: the REST transport and the connectivity probe.

pub mod client;
pub mod probe;

pub use client::{ApiClient, ApiRequest, ApiResponse, NetworkError, Transport};
pub use probe::{ConnectivityProbe, HttpProbe, ProbeMonitor, Subscription};
