//! Installer: populates a new generation from an asset manifest.
//!
//! Installs are single-flight per version id. The install itself runs on a
//! spawned task and callers await a shared handle to it, so a caller that
//! gives up does not cancel the work other callers are waiting on.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey, Response, StoredResponse};
use crate::error::{CacheError, CacheResult};
use crate::fetch::Fetcher;
use crate::generation::{Generation, GenerationState};
use crate::manifest::{FetchPolicy, Manifest};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first one
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(200),
      max_backoff: Duration::from_secs(5),
    }
  }
}

impl RetryPolicy {
  /// Delay before the attempt following failed attempt number `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .initial_backoff
      .saturating_mul(factor)
      .min(self.max_backoff)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
  pub retry: RetryPolicy,
  /// Deadline for a single fetch attempt
  pub fetch_timeout: Duration,
  /// Entries fetched in parallel
  pub concurrency: usize,
}

impl Default for InstallSettings {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      fetch_timeout: Duration::from_secs(10),
      concurrency: 4,
    }
  }
}

type SharedInstall = Shared<BoxFuture<'static, CacheResult<Arc<Generation>>>>;

#[derive(Default)]
struct InstallerState {
  in_flight: HashMap<String, SharedInstall>,
  /// Handles for sealed generations, so repeat installs return the same one
  sealed: HashMap<String, Weak<Generation>>,
}

struct InstallerInner<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  origin: Url,
  settings: InstallSettings,
  state: Mutex<InstallerState>,
}

pub struct Installer<S: CacheStorage> {
  inner: Arc<InstallerInner<S>>,
}

impl<S: CacheStorage + 'static> Installer<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    origin: Url,
    settings: InstallSettings,
  ) -> Self {
    Self {
      inner: Arc::new(InstallerInner {
        storage,
        fetcher,
        origin,
        settings,
        state: Mutex::new(InstallerState::default()),
      }),
    }
  }

  /// Make a generation restored elsewhere the answer for repeat installs.
  pub fn remember(&self, generation: &Arc<Generation>) {
    self
      .inner
      .lock_state()
      .sealed
      .insert(generation.version_id().to_string(), Arc::downgrade(generation));
  }

  /// Whether an install for this version is currently running
  #[cfg(test)]
  pub fn is_installing(&self, version_id: &str) -> bool {
    self.inner.lock_state().in_flight.contains_key(version_id)
  }

  /// Install the manifest's generation, or join/return an existing one.
  pub async fn install(&self, manifest: Manifest) -> CacheResult<Arc<Generation>> {
    let version_id = manifest.version_id.clone();

    let shared = {
      let mut state = self.inner.lock_state();

      if let Some(existing) = state.in_flight.get(&version_id) {
        debug!(version_id, "joining in-flight install");
        existing.clone()
      } else {
        if let Some(generation) = self.inner.existing_sealed(&mut state, &manifest)? {
          debug!(version_id, "generation already sealed, skipping install");
          return Ok(generation);
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(manifest).await });
        let shared = async move {
          task
            .await
            .unwrap_or_else(|e| Err(CacheError::Internal(format!("install task failed: {}", e))))
        }
        .boxed()
        .shared();

        state.in_flight.insert(version_id, shared.clone());
        shared
      }
    };

    shared.await
  }
}

impl<S: CacheStorage> Clone for Installer<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage + 'static> InstallerInner<S> {
  fn lock_state(&self) -> std::sync::MutexGuard<'_, InstallerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn existing_sealed(
    &self,
    state: &mut InstallerState,
    manifest: &Manifest,
  ) -> CacheResult<Option<Arc<Generation>>> {
    let version_id = &manifest.version_id;

    state.sealed.retain(|_, handle| {
      handle
        .upgrade()
        .is_some_and(|g| g.state() != GenerationState::Evicted)
    });

    if let Some(generation) = state.sealed.get(version_id).and_then(Weak::upgrade) {
      if generation.state() != GenerationState::Evicted {
        return Ok(Some(generation));
      }
    }

    match self.storage.load_generation(version_id)? {
      Some(record) if record.is_sealed() => {
        if record.manifest_digest != manifest.digest() {
          warn!(
            version_id,
            "manifest changed for an already sealed version; keeping the sealed generation"
          );
        }
        let generation = Arc::new(Generation::from_record(&record, &self.origin)?);
        state
          .sealed
          .insert(version_id.clone(), Arc::downgrade(&generation));
        Ok(Some(generation))
      }
      _ => Ok(None),
    }
  }

  async fn run(self: Arc<Self>, manifest: Manifest) -> CacheResult<Arc<Generation>> {
    let result = self.populate(&manifest).await;

    let mut state = self.lock_state();
    if let Ok(generation) = &result {
      state.sealed.insert(
        manifest.version_id.clone(),
        Arc::downgrade(generation),
      );
    }
    state.in_flight.remove(&manifest.version_id);

    result
  }

  async fn populate(&self, manifest: &Manifest) -> CacheResult<Arc<Generation>> {
    let version_id = manifest.version_id.as_str();
    let entries = manifest.resolve(&self.origin)?;

    info!(
      version_id,
      entries = entries.len(),
      must_cache = manifest.must_cache_count(),
      "installing generation"
    );

    self.storage.create_generation(manifest)?;

    let sealed_at = match self.fill(version_id, &entries).await {
      Ok(()) => self.storage.seal_generation(version_id),
      Err(e) => Err(e),
    };

    match sealed_at {
      Ok(sealed_at) => {
        info!(version_id, "generation sealed");
        Ok(Arc::new(Generation::sealed(version_id, entries, sealed_at)))
      }
      Err(e) => {
        warn!(version_id, error = %e, "install aborted, discarding partial generation");
        if let Err(cleanup) = self.storage.delete_generation(version_id) {
          error!(version_id, error = %cleanup, "failed to discard partial generation");
        }
        Err(e)
      }
    }
  }

  /// Fetch and store every entry. Stops at the first fatal failure.
  async fn fill(&self, version_id: &str, entries: &[(RequestKey, FetchPolicy)]) -> CacheResult<()> {
    let fetcher = self.fetcher.as_ref();
    let settings = &self.settings;

    let mut results = stream::iter(entries.to_vec())
      .map(|(key, policy)| async move {
        let result = fetch_with_retry(fetcher, &key, settings).await;
        (key, policy, result)
      })
      .buffer_unordered(settings.concurrency.max(1));

    let mut skipped = 0usize;
    while let Some((key, policy, result)) = results.next().await {
      match result {
        Ok(response) => {
          self
            .storage
            .put(version_id, &key, &StoredResponse::now(response))?;
          debug!(version_id, key = %key, "stored entry");
        }
        Err(e) if policy == FetchPolicy::MustCache => {
          return Err(CacheError::InstallAborted {
            version_id: version_id.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
          });
        }
        Err(e) => {
          skipped += 1;
          warn!(version_id, key = %key, error = %e, "skipping opportunistic entry");
        }
      }
    }

    if skipped > 0 {
      info!(version_id, skipped, "opportunistic entries missing from generation");
    }
    Ok(())
  }
}

/// Fetch one resource, retrying failures per the policy.
///
/// Non-2xx responses count as failed attempts.
pub async fn fetch_with_retry(
  fetcher: &dyn Fetcher,
  key: &RequestKey,
  settings: &InstallSettings,
) -> CacheResult<Response> {
  let max_attempts = settings.retry.max_attempts.max(1);
  let mut attempt = 1;

  loop {
    let failure = match tokio::time::timeout(settings.fetch_timeout, fetcher.fetch(key, &[])).await {
      Ok(Ok(response)) if response.is_success() => return Ok(response),
      Ok(Ok(response)) => CacheError::HttpStatus {
        url: key.url().to_string(),
        status: response.status,
      },
      Ok(Err(e)) => e,
      Err(_) => CacheError::NetworkTimeout {
        url: key.url().to_string(),
        timeout: settings.fetch_timeout,
      },
    };

    if attempt >= max_attempts || !failure.is_retryable() {
      return Err(failure);
    }

    let backoff = settings.retry.backoff(attempt);
    warn!(
      key = %key,
      error = %failure,
      retry = attempt,
      max_attempts,
      backoff_ms = backoff.as_millis() as u64,
      "retrying fetch"
    );
    tokio::time::sleep(backoff).await;
    attempt += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::fetch::testing::{origin, ScriptedFetcher};
  use tokio::time::Instant;

  struct Fixture {
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
    installer: Installer<SqliteStorage>,
  }

  fn fixture() -> Fixture {
    fixture_with(SqliteStorage::open_in_memory().unwrap())
  }

  fn fixture_with(storage: SqliteStorage) -> Fixture {
    let storage = Arc::new(storage);
    let fetcher = Arc::new(ScriptedFetcher::new());
    let installer = Installer::new(
      Arc::clone(&storage),
      fetcher.clone(),
      origin(),
      InstallSettings::default(),
    );
    Fixture {
      storage,
      fetcher,
      installer,
    }
  }

  fn manifest(json: &str) -> Manifest {
    Manifest::from_json(json).unwrap()
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::resolve(&origin(), "GET", path).unwrap()
  }

  const V1: &str = r#"{"versionId":"v1","entries":[
    {"key":"/index.html","policy":"must-cache"},
    {"key":"/app.js","policy":"must-cache"},
    {"key":"/hero.png","policy":"opportunistic"}]}"#;

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff(1), Duration::from_millis(200));
    assert_eq!(policy.backoff(2), Duration::from_millis(400));
    assert_eq!(policy.backoff(3), Duration::from_millis(800));
    assert_eq!(policy.backoff(10), Duration::from_secs(5));
    assert_eq!(policy.backoff(40), Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_install_seals_complete_generation() {
    let f = fixture();
    f.fetcher.serve("/index.html", "<h1>v1</h1>");
    f.fetcher.serve("/app.js", "console.log(1)");
    f.fetcher.serve("/hero.png", "png");

    let generation = f.installer.install(manifest(V1)).await.unwrap();
    assert_eq!(generation.version_id(), "v1");
    assert_eq!(generation.state(), GenerationState::Sealed);

    let record = f.storage.load_generation("v1").unwrap().unwrap();
    assert!(record.is_sealed());
    for path in ["/index.html", "/app.js", "/hero.png"] {
      assert!(f.storage.get("v1", &key(path)).unwrap().is_some(), "{}", path);
    }
    assert!(!f.installer.is_installing("v1"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_opportunistic_failure_does_not_block_sealing() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.fail("/hero.png");

    let generation = f.installer.install(manifest(V1)).await.unwrap();
    assert_eq!(generation.state(), GenerationState::Sealed);
    assert!(f.storage.get("v1", &key("/hero.png")).unwrap().is_none());
    assert_eq!(f.fetcher.calls("/hero.png"), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_must_cache_failure_aborts_and_discards() {
    let f = fixture();
    let v2 = manifest(r#"{"versionId":"v2","entries":[{"key":"/app.css","policy":"must-cache"}]}"#);
    f.fetcher.fail("/app.css");

    let err = f.installer.install(v2).await.unwrap_err();
    assert!(matches!(err, CacheError::InstallAborted { ref version_id, .. } if version_id == "v2"));
    assert_eq!(f.fetcher.calls("/app.css"), 3);
    assert!(f.storage.load_generation("v2").unwrap().is_none());
    assert!(!f.installer.is_installing("v2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_follows_backoff_schedule() {
    let f = fixture();
    f.fetcher.fail_times("/index.html", 2, "ok");
    let settings = InstallSettings::default();

    let started = Instant::now();
    let response = fetch_with_retry(f.fetcher.as_ref(), &key("/index.html"), &settings)
      .await
      .unwrap();

    assert_eq!(response.body, b"ok");
    assert_eq!(f.fetcher.calls("/index.html"), 3);
    // 200ms after the first failure, 400ms after the second
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(700), "{:?}", elapsed);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_fetch_times_out() {
    let f = fixture();
    f.fetcher.hang("/index.html");
    let settings = InstallSettings {
      retry: RetryPolicy {
        max_attempts: 1,
        ..RetryPolicy::default()
      },
      ..InstallSettings::default()
    };

    let err = fetch_with_retry(f.fetcher.as_ref(), &key("/index.html"), &settings)
      .await
      .unwrap_err();
    assert!(matches!(err, CacheError::NetworkTimeout { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_error_status_counts_as_failure() {
    let f = fixture();
    f.fetcher
      .serve_response("/index.html", Response::new(500, "boom"));

    let err = fetch_with_retry(f.fetcher.as_ref(), &key("/index.html"), &InstallSettings::default())
      .await
      .unwrap_err();
    assert_eq!(
      err,
      CacheError::HttpStatus {
        url: crate::fetch::testing::url("/index.html"),
        status: 500
      }
    );
    assert_eq!(f.fetcher.calls("/index.html"), 3);
  }

  #[tokio::test]
  async fn test_reinstall_of_sealed_version_is_noop() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");

    let first = f.installer.install(manifest(V1)).await.unwrap();
    let calls = f.fetcher.total_calls();
    let second = f.installer.install(manifest(V1)).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.fetcher.total_calls(), calls);
    for path in ["/index.html", "/app.js", "/hero.png"] {
      assert_eq!(f.fetcher.calls(path), 1);
    }
  }

  #[tokio::test]
  async fn test_reinstall_uses_storage_after_restart() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");
    drop(f.installer.install(manifest(V1)).await.unwrap());

    // A fresh installer over the same store knows nothing in memory
    let installer = Installer::new(
      Arc::clone(&f.storage),
      f.fetcher.clone(),
      origin(),
      InstallSettings::default(),
    );
    let generation = installer.install(manifest(V1)).await.unwrap();
    assert_eq!(generation.version_id(), "v1");
    assert_eq!(f.fetcher.total_calls(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_installs_share_one_attempt() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");
    f.fetcher.set_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
      f.installer.install(manifest(V1)),
      f.installer.install(manifest(V1))
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    for path in ["/index.html", "/app.js", "/hero.png"] {
      assert_eq!(f.fetcher.calls(path), 1, "{}", path);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_caller_does_not_cancel_joined_install() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");
    f.fetcher.set_delay(Duration::from_millis(100));

    let first = f.installer.clone();
    let abandoned = tokio::spawn(async move { first.install(manifest(V1)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(f.installer.is_installing("v1"));

    let joined = f.installer.install(manifest(V1));
    abandoned.abort();
    let generation = joined.await.unwrap();

    assert_eq!(generation.state(), GenerationState::Sealed);
    assert_eq!(f.fetcher.total_calls(), 3);
  }

  #[tokio::test]
  async fn test_storage_full_aborts_install() {
    let f = fixture_with(SqliteStorage::open_in_memory().unwrap().with_quota(Some(4)));
    f.fetcher.serve("/index.html", "too large for quota");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");

    let err = f.installer.install(manifest(V1)).await.unwrap_err();
    assert!(matches!(err, CacheError::StorageFull { .. }));
    assert!(f.storage.list_generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_released_handles_are_forgotten() {
    let f = fixture();
    f.fetcher.serve("/index.html", "index");
    f.fetcher.serve("/app.js", "app");
    f.fetcher.serve("/hero.png", "png");

    drop(f.installer.install(manifest(V1)).await.unwrap());
    let v2 = f
      .installer
      .install(manifest(r#"{"versionId":"v2","entries":[{"key":"/index.html","policy":"must-cache"}]}"#))
      .await
      .unwrap();

    let state = f.installer.inner.lock_state();
    assert!(!state.sealed.contains_key("v1"));
    assert!(state.sealed.contains_key(v2.version_id()));
  }
}
