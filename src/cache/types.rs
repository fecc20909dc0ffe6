//! Core request, response and key types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::{CacheError, CacheResult};

/// Canonical identity of a cacheable request: method plus absolute URL.
///
/// The query string is part of the identity, the fragment is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  /// Resolve a possibly relative URL against the origin and build its key.
  pub fn resolve(origin: &Url, method: &str, raw: &str) -> CacheResult<Self> {
    let mut url = origin.join(raw.trim()).map_err(|e| CacheError::InvalidUrl {
      url: raw.to_string(),
      reason: e.to_string(),
    })?;
    url.set_fragment(None);

    Ok(Self {
      method: method.trim().to_ascii_uppercase(),
      url,
    })
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// Only GET responses are ever written to the store
  pub fn is_cacheable(&self) -> bool {
    self.method == "GET"
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// An outgoing request from a client context.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  /// Caller-supplied deadline for the network leg, overrides the default
  pub timeout: Option<Duration>,
}

impl Request {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_string(),
      url: url.to_string(),
      headers: Vec::new(),
      timeout: None,
    }
  }

  #[cfg(test)]
  pub fn get(url: &str) -> Self {
    Self::new("GET", url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// A response as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response snapshot held by the cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response: Response,
  /// When the snapshot was written
  pub stored_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn now(response: Response) -> Self {
    Self {
      response,
      stored_at: Utc::now(),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from the current generation
  Cache,
  /// Neither network nor cache could answer; offline placeholder
  Fallback,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
    })
  }
}

/// Response handed back to the client, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// Generation that answered (if from cache)
  pub version_id: Option<String>,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Create a served response from fresh network data.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      version_id: None,
      cached_at: None,
    }
  }

  /// Create a served response from a cached snapshot.
  pub fn from_cache(stored: StoredResponse, version_id: &str) -> Self {
    Self {
      response: stored.response,
      source: CacheSource::Cache,
      version_id: Some(version_id.to_string()),
      cached_at: Some(stored.stored_at),
    }
  }

  /// Create the offline placeholder response.
  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      version_id: None,
      cached_at: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://app.example.com/").unwrap()
  }

  #[test]
  fn test_key_resolves_relative_urls() {
    let key = RequestKey::resolve(&origin(), "get", "/index.html").unwrap();
    assert_eq!(key.to_string(), "GET https://app.example.com/index.html");
    assert!(key.is_cacheable());
  }

  #[test]
  fn test_key_keeps_query_drops_fragment() {
    let a = RequestKey::resolve(&origin(), "GET", "/app.js?v=2#main").unwrap();
    let b = RequestKey::resolve(&origin(), "GET", "https://app.example.com/app.js?v=2").unwrap();
    let c = RequestKey::resolve(&origin(), "GET", "/app.js?v=3").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn test_key_distinguishes_methods() {
    let get = RequestKey::resolve(&origin(), "GET", "/api").unwrap();
    let post = RequestKey::resolve(&origin(), "POST", "/api").unwrap();
    assert_ne!(get, post);
    assert!(!post.is_cacheable());
  }

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert!(response.is_success());
    assert!(!Response::new(404, "").is_success());
  }
}
