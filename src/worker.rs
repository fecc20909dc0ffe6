//! Background caching context: one store, one current pointer, many requests.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::activate::Activator;
use crate::bridge::{ClientBridge, ClientHandle};
use crate::cache::{
  CacheStorage, InterceptSettings, Interceptor, Request, Served, StoredState,
};
use crate::error::CacheResult;
use crate::fetch::Fetcher;
use crate::generation::{Generation, GenerationState};
use crate::install::{InstallSettings, Installer};
use crate::manifest::Manifest;

/// Summary of one stored generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationSummary {
  pub version_id: String,
  pub state: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
  pub sealed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
  pub current: Option<String>,
  pub generations: Vec<GenerationSummary>,
}

pub struct CacheWorker<S: CacheStorage> {
  storage: Arc<S>,
  origin: Url,
  bridge: ClientBridge,
  installer: Installer<S>,
  activator: Arc<Activator<S>>,
  interceptor: Interceptor<S>,
}

impl<S: CacheStorage + 'static> CacheWorker<S> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<dyn Fetcher>,
    origin: Url,
    install: InstallSettings,
    intercept: InterceptSettings,
  ) -> Self {
    let bridge = ClientBridge::default();
    let activator = Arc::new(Activator::new(Arc::clone(&storage), bridge.clone()));
    let installer = Installer::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      origin.clone(),
      install,
    );
    let interceptor = Interceptor::new(
      Arc::clone(&storage),
      fetcher,
      Arc::clone(&activator),
      origin.clone(),
      intercept,
    );

    Self {
      storage,
      origin,
      bridge,
      installer,
      activator,
      interceptor,
    }
  }

  /// Recover state left by a previous run. Call once before serving.
  pub async fn start(&self) -> CacheResult<()> {
    let restored = self.activator.restore(&self.origin).await?;
    for generation in &restored {
      self.installer.remember(generation);
    }
    debug!(restored = restored.len(), "worker started");
    Ok(())
  }

  /// Install a manifest's generation without activating it.
  pub async fn install(&self, manifest: Manifest) -> CacheResult<Arc<Generation>> {
    self.installer.install(manifest).await
  }

  pub async fn activate(&self, generation: Arc<Generation>) -> CacheResult<()> {
    self.activator.activate(generation).await
  }

  /// Install, activate and clean up after a new deploy.
  ///
  /// A failed install leaves the current generation untouched.
  pub async fn update(&self, manifest: Manifest) -> CacheResult<Arc<Generation>> {
    let generation = self.install(manifest).await?;
    self.activate(Arc::clone(&generation)).await?;

    let evicted = self.evict().await?;
    if !evicted.is_empty() {
      debug!(?evicted, "evicted after update");
    }
    Ok(generation)
  }

  pub async fn handle(&self, request: Request) -> Served {
    self.interceptor.handle(request).await
  }

  /// Evict superseded generations that nobody reads anymore.
  pub async fn evict(&self) -> CacheResult<Vec<String>> {
    self.activator.evict_superseded().await
  }

  /// Register a foreground context for update notifications.
  pub fn subscribe(&self) -> ClientHandle {
    self.bridge.subscribe()
  }

  pub fn current_version(&self) -> Option<String> {
    self.activator.current_version()
  }

  pub async fn status(&self) -> CacheResult<WorkerStatus> {
    let current = self.current_version();
    let superseded = self.activator.superseded().await;

    let generations = self
      .storage
      .list_generations()?
      .into_iter()
      .map(|record| {
        let state = if record.state == StoredState::Installing {
          GenerationState::Installing
        } else if current.as_deref() == Some(record.version_id.as_str()) {
          GenerationState::Current
        } else if superseded.contains(&record.version_id) {
          GenerationState::Superseded
        } else {
          GenerationState::Sealed
        };

        GenerationSummary {
          version_id: record.version_id,
          state: state.to_string(),
          entries: record.entry_count,
          created_at: record.created_at,
          sealed_at: record.sealed_at,
        }
      })
      .collect();

    Ok(WorkerStatus {
      current,
      generations,
    })
  }

  /// Periodically retry eviction of generations that were still leased.
  pub fn spawn_eviction_sweeper(&self, period: Duration) -> JoinHandle<()> {
    let activator = Arc::clone(&self.activator);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match activator.evict_superseded().await {
          Ok(evicted) if !evicted.is_empty() => info!(?evicted, "sweeper evicted generations"),
          Ok(_) => {}
          Err(e) => warn!(error = %e, "eviction sweep failed"),
        }
      }
    })
  }
}
