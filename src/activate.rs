//! Version activator: owns the current pointer and evicts old generations.
//!
//! The current pointer is a single-writer, many-reader value. Requests read it
//! fresh each time and take a lease on what they find; activations replace it
//! in one step after the durable pointer has been written.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::{ClientBridge, Delivery};
use crate::cache::CacheStorage;
use crate::error::{CacheError, CacheResult};
use crate::generation::{Generation, GenerationState, Lease};

pub struct Activator<S: CacheStorage> {
  storage: Arc<S>,
  bridge: ClientBridge,
  current: watch::Sender<Option<Arc<Generation>>>,
  /// Also serializes activation and eviction
  queues: Mutex<Queues>,
}

#[derive(Default)]
struct Queues {
  /// Replaced by a newer activation and not yet deleted
  superseded: Vec<Arc<Generation>>,
  /// Restored sealed generations newer than the restored current one
  standby: Vec<Arc<Generation>>,
}

impl<S: CacheStorage> Activator<S> {
  pub fn new(storage: Arc<S>, bridge: ClientBridge) -> Self {
    let (current, _) = watch::channel(None);
    Self {
      storage,
      bridge,
      current,
      queues: Mutex::new(Queues::default()),
    }
  }

  /// Rebuild in-memory state from the store after a restart.
  ///
  /// Partial generations are purged. The durable pointer becomes current;
  /// sealed generations older than it are queued for eviction. Returns every
  /// handle it created.
  pub async fn restore(&self, origin: &Url) -> CacheResult<Vec<Arc<Generation>>> {
    let mut queues = self.queues.lock().await;

    let purged = self.storage.purge_unsealed()?;
    if !purged.is_empty() {
      info!(?purged, "discarded partial generations");
    }

    let records = self.storage.list_generations()?;
    let pointer = self.storage.current()?;
    let current_record = pointer
      .as_deref()
      .and_then(|id| records.iter().find(|r| r.version_id == id && r.is_sealed()));

    if pointer.is_some() && current_record.is_none() {
      warn!(?pointer, "current pointer names a missing generation, clearing it");
      self.storage.set_current(None)?;
    }

    let Some(current_record) = current_record else {
      return Ok(Vec::new());
    };

    let current = Arc::new(Generation::from_record(current_record, origin)?);
    current.transition(GenerationState::Current)?;
    self.current.send_replace(Some(Arc::clone(&current)));

    let mut restored = vec![current];
    for record in &records {
      if !record.is_sealed() || record.version_id == current_record.version_id {
        continue;
      }
      let generation = Arc::new(Generation::from_record(record, origin)?);
      if generation.sealed_at() < current_record.sealed_at.unwrap_or_default() {
        generation.transition(GenerationState::Superseded)?;
        queues.superseded.push(Arc::clone(&generation));
      } else {
        info!(
          version_id = generation.version_id(),
          "sealed generation newer than current, kept until the next activation"
        );
        queues.standby.push(Arc::clone(&generation));
      }
      restored.push(generation);
    }

    info!(
      current = %current_record.version_id,
      superseded = queues.superseded.len(),
      standby = queues.standby.len(),
      "restored cache state"
    );
    Ok(restored)
  }

  /// The generation currently answering requests
  pub fn current(&self) -> Option<Arc<Generation>> {
    self.current.borrow().clone()
  }

  pub fn current_version(&self) -> Option<String> {
    self.current().map(|g| g.version_id().to_string())
  }

  /// Lease the current generation for the duration of one request.
  pub fn lease(&self) -> Option<Lease> {
    loop {
      let generation = self.current()?;
      if let Some(lease) = generation.lease() {
        return Some(lease);
      }
      // Evicted between the read and the lease; only possible if the
      // pointer has already moved on.
      let moved = self
        .current()
        .map(|now| !Arc::ptr_eq(&now, &generation))
        .unwrap_or(true);
      if !moved {
        return None;
      }
    }
  }

  /// Promote a sealed generation to current.
  ///
  /// The previous current generation becomes superseded. Activating the
  /// generation that is already current does nothing.
  pub async fn activate(&self, generation: Arc<Generation>) -> CacheResult<()> {
    let mut queues = self.queues.lock().await;
    let version_id = generation.version_id().to_string();

    if self.current_version().as_deref() == Some(version_id.as_str()) {
      debug!(version_id, "generation already current");
      return Ok(());
    }

    let state = generation.state();
    if !state.can_transition_to(GenerationState::Current) {
      return Err(CacheError::InvalidTransition {
        version_id,
        from: state.to_string(),
        to: GenerationState::Current.to_string(),
      });
    }
    if generation.is_evicted() {
      return Err(CacheError::GenerationNotFound(version_id));
    }

    // Re-activating an older generation takes it off the eviction queue
    queues.superseded.retain(|g| g.version_id() != version_id);
    queues.standby.retain(|g| g.version_id() != version_id);

    self.storage.set_current(Some(&version_id))?;
    generation.transition(GenerationState::Current)?;
    let previous = self.current.send_replace(Some(Arc::clone(&generation)));

    let previous_version = previous.as_ref().map(|g| g.version_id().to_string());
    if let Some(previous) = previous {
      if let Err(e) = previous.transition(GenerationState::Superseded) {
        warn!(error = %e, "unexpected state for replaced generation");
      }
      queues.superseded.push(previous);
    }

    // The pointer has moved past any restored standby generation
    let standby = std::mem::take(&mut queues.standby);
    for waiting in standby {
      if let Err(e) = waiting.transition(GenerationState::Superseded) {
        warn!(error = %e, "unexpected state for standby generation");
      }
      queues.superseded.push(waiting);
    }

    info!(version_id, previous = ?previous_version, "activated generation");

    match self.bridge.notify(&version_id) {
      Delivery::Delivered(listeners) => debug!(version_id, listeners, "update announced"),
      Delivery::NoForegroundListener => {}
    }

    Ok(())
  }

  /// Delete superseded generations that no request is reading.
  ///
  /// Generations still leased stay queued for the next sweep.
  pub async fn evict_superseded(&self) -> CacheResult<Vec<String>> {
    let mut queues = self.queues.lock().await;
    let mut removed = Vec::new();
    let mut remaining = Vec::new();

    for generation in std::mem::take(&mut queues.superseded) {
      let version_id = generation.version_id().to_string();

      if !generation.is_evicted() && !generation.try_mark_evicted() {
        debug!(version_id, readers = generation.readers(), "generation still in use");
        remaining.push(generation);
        continue;
      }

      match self.storage.delete_generation(&version_id) {
        Ok(()) => {
          if let Err(e) = generation.transition(GenerationState::Evicted) {
            warn!(version_id, error = %e, "unexpected state for evicted generation");
          }
          info!(version_id, "evicted generation");
          removed.push(version_id);
        }
        Err(e) => {
          warn!(version_id, error = %e, "failed to delete generation, will retry");
          remaining.push(generation);
        }
      }
    }

    queues.superseded = remaining;
    Ok(removed)
  }

  /// Ids of generations waiting for eviction
  pub async fn superseded(&self) -> Vec<String> {
    self
      .queues
      .lock()
      .await
      .superseded
      .iter()
      .map(|g| g.version_id().to_string())
      .collect()
  }
}
