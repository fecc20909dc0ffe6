//! Request interceptor that answers requests from the current generation,
//! the network, or an offline fallback.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::{Request, RequestKey, Response, Served, StoredResponse};
use crate::activate::Activator;
use crate::error::CacheError;
use crate::fetch::Fetcher;
use crate::generation::Generation;
use crate::manifest::FetchPolicy;

/// Strategy for requests the current manifest does not mention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnmatchedPolicy {
  /// Try network, fall back to cache, then to the offline response
  #[default]
  NetworkFirst,
  /// Serve a cached entry if there is one, otherwise behave like network-first
  CacheFirst,
}

#[derive(Debug, Clone)]
pub struct InterceptSettings {
  /// Deadline for the network leg unless the request carries its own
  pub network_timeout: Duration,
  pub unmatched: UnmatchedPolicy,
  /// Store successful network responses as runtime entries
  pub backfill: bool,
  /// Returned when neither network nor cache can answer
  pub fallback: Response,
}

impl Default for InterceptSettings {
  fn default() -> Self {
    Self {
      network_timeout: Duration::from_secs(3),
      unmatched: UnmatchedPolicy::default(),
      backfill: true,
      fallback: offline_response(503, "text/html; charset=utf-8", DEFAULT_OFFLINE_BODY),
    }
  }
}

const DEFAULT_OFFLINE_BODY: &str =
  "<!doctype html><title>Offline</title><h1>You are offline</h1><p>This page is not available offline.</p>";

/// Build the placeholder served when nothing else can answer.
pub fn offline_response(status: u16, content_type: &str, body: &str) -> Response {
  Response::new(status, body)
    .with_header("content-type", content_type)
    .with_header("x-swcache-offline", "1")
}

/// Sits between client contexts and the network.
///
/// Never fails: every request gets a network, cached, or fallback response.
pub struct Interceptor<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  activator: Arc<Activator<S>>,
  origin: Url,
  settings: InterceptSettings,
}

impl<S: CacheStorage> Interceptor<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    activator: Arc<Activator<S>>,
    origin: Url,
    settings: InterceptSettings,
  ) -> Self {
    Self {
      storage,
      fetcher,
      activator,
      origin,
      settings,
    }
  }

  /// Answer one request.
  ///
  /// Dropping the returned future abandons any network fetch it started.
  pub async fn handle(&self, request: Request) -> Served {
    let key = match RequestKey::resolve(&self.origin, &request.method, &request.url) {
      Ok(key) => key,
      Err(e) => {
        warn!(url = %request.url, error = %e, "rejecting unresolvable request");
        return Served::fallback(Response::new(400, e.to_string()));
      }
    };

    if !key.is_cacheable() {
      return self.network_only(&key, &request).await;
    }

    // Resolved per request; held until the response is built
    let lease = self.activator.lease();
    let generation = lease.as_deref();

    match generation.and_then(|g| g.policy_for(&key)) {
      Some(FetchPolicy::MustCache) => {
        if let Some(served) = self.from_cache(generation, &key) {
          return served;
        }
        warn!(key = %key, "must-cache entry missing from current generation");
        self.network_first(generation, &key, &request).await
      }
      Some(FetchPolicy::Opportunistic) => self.network_first(generation, &key, &request).await,
      None => match self.settings.unmatched {
        UnmatchedPolicy::NetworkFirst => self.network_first(generation, &key, &request).await,
        UnmatchedPolicy::CacheFirst => match self.from_cache(generation, &key) {
          Some(served) => served,
          None => self.network_first(generation, &key, &request).await,
        },
      },
    }
  }

  fn from_cache(&self, generation: Option<&Generation>, key: &RequestKey) -> Option<Served> {
    let generation = generation?;
    match self.storage.get(generation.version_id(), key) {
      Ok(Some(stored)) => {
        debug!(key = %key, version_id = generation.version_id(), "served from cache");
        Some(Served::from_cache(stored, generation.version_id()))
      }
      Ok(None) => None,
      Err(e) => {
        warn!(key = %key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  async fn fetch(&self, key: &RequestKey, request: &Request) -> Result<Response, CacheError> {
    let timeout = request.timeout.unwrap_or(self.settings.network_timeout);
    match tokio::time::timeout(timeout, self.fetcher.fetch(key, &request.headers)).await {
      Ok(result) => result,
      Err(_) => Err(CacheError::NetworkTimeout {
        url: key.url().to_string(),
        timeout,
      }),
    }
  }

  async fn network_first(
    &self,
    generation: Option<&Generation>,
    key: &RequestKey,
    request: &Request,
  ) -> Served {
    match self.fetch(key, request).await {
      Ok(response) if response.status >= 500 => {
        if let Some(served) = self.from_cache(generation, key) {
          debug!(key = %key, status = response.status, "server error, serving cached copy");
          return served;
        }
        return Served::from_network(response);
      }
      Ok(response) => {
        if let Some(generation) = generation {
          self.backfill(generation, key, &response);
        }
        return Served::from_network(response);
      }
      Err(e) => debug!(key = %key, error = %e, "network failed, trying cache"),
    }

    if let Some(served) = self.from_cache(generation, key) {
      return served;
    }

    info!(key = %key, "serving offline fallback");
    Served::fallback(self.settings.fallback.clone())
  }

  async fn network_only(&self, key: &RequestKey, request: &Request) -> Served {
    match self.fetch(key, request).await {
      Ok(response) => Served::from_network(response),
      Err(e) => {
        info!(key = %key, error = %e, "serving offline fallback");
        Served::fallback(self.settings.fallback.clone())
      }
    }
  }

  fn backfill(&self, generation: &Generation, key: &RequestKey, response: &Response) {
    if !self.settings.backfill || !response.is_success() {
      return;
    }

    let stored = StoredResponse::now(response.clone());
    match self.storage.put_runtime(generation.version_id(), key, &stored) {
      Ok(()) => {}
      Err(e @ CacheError::StorageFull { .. }) => {
        warn!(key = %key, error = %e, "cache full, response not stored");
      }
      Err(e) => debug!(key = %key, error = %e, "backfill skipped"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::ClientBridge;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::fetch::testing::{origin, ScriptedFetcher};
  use crate::install::{InstallSettings, Installer};
  use crate::manifest::Manifest;

  struct Fixture {
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
    activator: Arc<Activator<SqliteStorage>>,
    installer: Installer<SqliteStorage>,
    interceptor: Arc<Interceptor<SqliteStorage>>,
  }

  fn fixture(settings: InterceptSettings) -> Fixture {
    fixture_with(SqliteStorage::open_in_memory().unwrap(), settings)
  }

  fn fixture_with(storage: SqliteStorage, settings: InterceptSettings) -> Fixture {
    let storage = Arc::new(storage);
    let fetcher = Arc::new(ScriptedFetcher::new());
    let activator = Arc::new(Activator::new(
      Arc::clone(&storage),
      ClientBridge::default(),
    ));
    let installer = Installer::new(
      Arc::clone(&storage),
      fetcher.clone(),
      origin(),
      InstallSettings::default(),
    );
    let interceptor = Arc::new(Interceptor::new(
      Arc::clone(&storage),
      fetcher.clone(),
      Arc::clone(&activator),
      origin(),
      settings,
    ));
    Fixture {
      storage,
      fetcher,
      activator,
      installer,
      interceptor,
    }
  }

  impl Fixture {
    async fn deploy(&self, json: &str) {
      let generation = self
        .installer
        .install(Manifest::from_json(json).unwrap())
        .await
        .unwrap();
      self.activator.activate(generation).await.unwrap();
    }
  }

  const V1: &str = r#"{"versionId":"v1","entries":[
    {"key":"/index.html","policy":"must-cache"},
    {"key":"/feed.json","policy":"opportunistic"}]}"#;

  #[tokio::test]
  async fn test_must_cache_served_without_network() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "<h1>v1</h1>");
    f.fetcher.serve("/feed.json", "[]");
    f.deploy(V1).await;
    let calls = f.fetcher.total_calls();

    let served = f.interceptor.handle(Request::get("/index.html")).await;

    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.version_id.as_deref(), Some("v1"));
    assert_eq!(served.response.body, b"<h1>v1</h1>");
    assert_eq!(f.fetcher.total_calls(), calls);
  }

  #[tokio::test]
  async fn test_opportunistic_prefers_network_and_falls_back_to_cache() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/feed.json", "[1]");
    f.deploy(V1).await;

    f.fetcher.serve("/feed.json", "[1,2]");
    let fresh = f.interceptor.handle(Request::get("/feed.json")).await;
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(fresh.response.body, b"[1,2]");

    // The sealed snapshot is not overwritten by the fresher response
    f.fetcher.set_offline(true);
    let cached = f.interceptor.handle(Request::get("/feed.json")).await;
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.version_id.as_deref(), Some("v1"));
    assert_eq!(cached.response.body, b"[1]");
  }

  #[tokio::test]
  async fn test_unmatched_request_is_backfilled() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "index");
    f.deploy(V1).await;

    f.fetcher.serve("/avatar.png", "png");
    let first = f.interceptor.handle(Request::get("/avatar.png")).await;
    assert_eq!(first.source, CacheSource::Network);

    f.fetcher.set_offline(true);
    let second = f.interceptor.handle(Request::get("/avatar.png")).await;
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.body, b"png");
  }

  #[tokio::test]
  async fn test_backfill_can_be_disabled() {
    let f = fixture(InterceptSettings {
      backfill: false,
      ..InterceptSettings::default()
    });
    f.fetcher.serve("/index.html", "index");
    f.deploy(V1).await;

    f.fetcher.serve("/avatar.png", "png");
    f.interceptor.handle(Request::get("/avatar.png")).await;
    f.fetcher.set_offline(true);

    let served = f.interceptor.handle(Request::get("/avatar.png")).await;
    assert_eq!(served.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_total_miss_returns_offline_fallback() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.set_offline(true);

    let served = f.interceptor.handle(Request::get("/missing.png")).await;

    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.status, 503);
    assert_eq!(served.response.header("x-swcache-offline"), Some("1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_network_timeout_falls_back() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/feed.json", "[1]");
    f.deploy(V1).await;

    f.fetcher.hang("/feed.json");
    let served = f.interceptor.handle(Request::get("/feed.json")).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"[1]");

    f.fetcher.hang("/slow");
    let started = tokio::time::Instant::now();
    let served = f
      .interceptor
      .handle(Request::get("/slow").with_timeout(Duration::from_millis(250)))
      .await;
    assert_eq!(served.source, CacheSource::Fallback);
    assert!(started.elapsed() < Duration::from_secs(1));
  }

  #[tokio::test]
  async fn test_no_stale_read_after_activation() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "v1");
    f.deploy(V1).await;
    assert_eq!(
      f.interceptor.handle(Request::get("/index.html")).await.response.body,
      b"v1"
    );

    f.fetcher.serve("/index.html", "v2");
    f.deploy(r#"{"versionId":"v2","entries":[{"key":"/index.html","policy":"must-cache"}]}"#)
      .await;

    let served = f.interceptor.handle(Request::get("/index.html")).await;
    assert_eq!(served.version_id.as_deref(), Some("v2"));
    assert_eq!(served.response.body, b"v2");
  }

  #[tokio::test]
  async fn test_cache_first_unmatched_policy() {
    let f = fixture(InterceptSettings {
      unmatched: UnmatchedPolicy::CacheFirst,
      ..InterceptSettings::default()
    });
    f.fetcher.serve("/index.html", "index");
    f.deploy(V1).await;

    f.fetcher.serve("/logo.svg", "old");
    f.interceptor.handle(Request::get("/logo.svg")).await;
    f.fetcher.serve("/logo.svg", "new");

    let served = f.interceptor.handle(Request::get("/logo.svg")).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"old");
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_cache() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "index");
    f.deploy(V1).await;

    f.fetcher.serve("/api/save", "saved");
    let served = f.interceptor.handle(Request::new("POST", "/api/save")).await;
    assert_eq!(served.source, CacheSource::Network);

    f.fetcher.set_offline(true);
    let served = f.interceptor.handle(Request::new("POST", "/index.html")).await;
    assert_eq!(served.source, CacheSource::Fallback);
  }

  #[tokio::test]
  async fn test_invalid_url_is_answered() {
    let f = fixture(InterceptSettings::default());
    let served = f.interceptor.handle(Request::get("http://[::1")).await;
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.response.status, 400);
  }

  #[tokio::test(start_paused = true)]
  async fn test_in_flight_request_blocks_eviction() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "v1");
    f.fetcher.serve("/feed.json", "[1]");
    f.deploy(V1).await;

    f.fetcher.hang("/feed.json");
    let interceptor = Arc::clone(&f.interceptor);
    let request = tokio::spawn(async move { interceptor.handle(Request::get("/feed.json")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    f.fetcher.serve("/index.html", "v2");
    f.deploy(r#"{"versionId":"v2","entries":[{"key":"/index.html","policy":"must-cache"}]}"#)
      .await;
    assert!(f.activator.evict_superseded().await.unwrap().is_empty());

    let served = request.await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.version_id.as_deref(), Some("v1"));

    assert_eq!(
      f.activator.evict_superseded().await.unwrap(),
      vec!["v1".to_string()]
    );
  }

  #[tokio::test]
  async fn test_backfill_over_quota_still_serves_network() {
    let f = fixture_with(
      SqliteStorage::open_in_memory().unwrap().with_quota(Some(4)),
      InterceptSettings::default(),
    );
    f.fetcher.serve("/index.html", "ok");
    f.deploy(r#"{"versionId":"v1","entries":[{"key":"/index.html","policy":"must-cache"}]}"#)
      .await;

    f.fetcher.serve("/big.bin", "0123456789");
    let served = f.interceptor.handle(Request::get("/big.bin")).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.body, b"0123456789");

    let key = RequestKey::resolve(&origin(), "GET", "/big.bin").unwrap();
    assert!(f.storage.get("v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_server_error_falls_back_to_cached_copy() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/feed.json", "[1]");
    f.deploy(V1).await;

    f.fetcher.serve_response("/feed.json", Response::new(503, "busy"));
    let served = f.interceptor.handle(Request::get("/feed.json")).await;
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, b"[1]");

    // Nothing cached: the error response is what the client gets
    f.fetcher.serve_response("/status", Response::new(502, "bad gateway"));
    let served = f.interceptor.handle(Request::get("/status")).await;
    assert_eq!(served.source, CacheSource::Network);
    assert_eq!(served.response.status, 502);
  }

  #[tokio::test(start_paused = true)]
  async fn test_aborted_request_releases_its_lease() {
    let f = fixture(InterceptSettings::default());
    f.fetcher.serve("/index.html", "v1");
    f.fetcher.serve("/feed.json", "[1]");
    f.deploy(V1).await;

    f.fetcher.hang("/feed.json");
    let interceptor = Arc::clone(&f.interceptor);
    let request = tokio::spawn(async move { interceptor.handle(Request::get("/feed.json")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let v1 = f.activator.current().unwrap();
    assert_eq!(v1.readers(), 1);

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());
    assert_eq!(v1.readers(), 0);

    f.fetcher.serve("/index.html", "v2");
    f.deploy(r#"{"versionId":"v2","entries":[{"key":"/index.html","policy":"must-cache"}]}"#)
      .await;
    assert_eq!(
      f.activator.evict_superseded().await.unwrap(),
      vec!["v1".to_string()]
    );
  }
}
