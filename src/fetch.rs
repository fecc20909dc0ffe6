//! Network transport used by the installer and the interceptor.

use async_trait::async_trait;

use crate::cache::{RequestKey, Response};
use crate::error::{CacheError, CacheResult};

/// Something that can perform a request against the network.
///
/// Deadlines are applied by callers, so implementations only need to report
/// transport failures.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, key: &RequestKey, headers: &[(String, String)]) -> CacheResult<Response>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> CacheResult<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| CacheError::Internal(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, key: &RequestKey, headers: &[(String, String)]) -> CacheResult<Response> {
    let network_error = |e: reqwest::Error| CacheError::Network {
      url: key.url().to_string(),
      reason: e.to_string(),
    };

    let method =
      reqwest::Method::from_bytes(key.method().as_bytes()).map_err(|e| CacheError::InvalidUrl {
        url: key.to_string(),
        reason: e.to_string(),
      })?;

    let mut request = self.client.request(method, key.url().clone());
    for (name, value) in headers {
      request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(network_error)?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(network_error)?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
