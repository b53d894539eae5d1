//! HTTP boundary to the REST backend.
//!
//! Failures come back as a typed [`NetworkError`] so callers branch on data:
//! a server that answered with 4xx/5xx is never confused with a server that
//! could not be reached.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::endpoint::EndpointKey;
use crate::queue::MutationMethod;

/// Failure of a single HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
  /// The server answered and rejected the request.
  #[error("server rejected request ({status}): {message}")]
  Server { status: u16, message: String },

  /// The server was not reached: timeout, DNS, TLS, refused or dropped connection.
  #[error("server unreachable: {0}")]
  Unreachable(String),

  /// The request could not be built.
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl NetworkError {
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Unreachable(_))
  }
}

/// One request to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
  pub method: Method,
  pub endpoint: EndpointKey,
  pub body: Option<Vec<u8>>,
  /// Full `Authorization` header value, e.g. `Bearer <token>`
  pub auth_header: Option<String>,
}

impl ApiRequest {
  pub fn get(endpoint: EndpointKey, auth_header: Option<String>) -> Self {
    Self {
      method: Method::GET,
      endpoint,
      body: None,
      auth_header,
    }
  }

  pub fn mutation(
    method: MutationMethod,
    endpoint: EndpointKey,
    body: Option<Vec<u8>>,
    auth_header: Option<String>,
  ) -> Self {
    Self {
      method: method.into(),
      endpoint,
      body,
      auth_header,
    }
  }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn ok(body: impl Into<Vec<u8>>) -> Self {
    Self {
      status: 200,
      body: body.into(),
    }
  }

  /// Decode the body as JSON.
  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }
}

/// Transport abstraction so the gateway can run against a real HTTP client or
/// a scripted double.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, NetworkError>;
}

/// reqwest-backed client for the REST API.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  /// Always ends in `/` so joins keep any base path such as `/v1`
  base_url: Url,
}

impl ApiClient {
  /// Create a client for `base_url`; every request is bounded by `timeout`.
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let mut base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Invalid API base URL {}: not a base URL", base_url));
    }
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: base,
    })
  }

  /// Resolve the request target against the base URL, keeping the caller's
  /// query string as written.
  fn url_for(&self, endpoint: &EndpointKey) -> Result<Url, NetworkError> {
    self
      .base_url
      .join(&format!(".{}", endpoint.request_target()))
      .map_err(|e| NetworkError::Invalid(format!("{}: {}", endpoint, e)))
  }
}

#[async_trait]
impl Transport for ApiClient {
  async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, NetworkError> {
    let url = self.url_for(&request.endpoint)?;
    debug!(method = %request.method, %url, "sending request");

    let mut builder = self
      .http
      .request(request.method.clone(), url)
      .header(ACCEPT, "application/json");
    if let Some(auth) = &request.auth_header {
      builder = builder.header(AUTHORIZATION, auth);
    }
    if let Some(body) = &request.body {
      builder = builder.header(CONTENT_TYPE, "application/json").body(body.clone());
    }

    let response = builder.send().await.map_err(classify_reqwest_error)?;
    let status = response.status();
    let body = response.bytes().await.map_err(classify_reqwest_error)?.to_vec();

    if !status.is_success() {
      return Err(NetworkError::Server {
        status: status.as_u16(),
        message: error_message(status, &body),
      });
    }

    Ok(ApiResponse {
      status: status.as_u16(),
      body,
    })
  }
}

fn classify_reqwest_error(e: reqwest::Error) -> NetworkError {
  if e.is_builder() {
    NetworkError::Invalid(e.to_string())
  } else {
    // Timeouts count as unreachable, never as a server rejection
    NetworkError::Unreachable(e.to_string())
  }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
  message: Option<String>,
  error: Option<String>,
}

/// Pull a human-readable message out of an error envelope.
fn error_message(status: StatusCode, body: &[u8]) -> String {
  serde_json::from_slice::<ErrorEnvelope>(body)
    .ok()
    .and_then(|env| env.message.or(env.error))
    .unwrap_or_else(|| {
      status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
    })
}
