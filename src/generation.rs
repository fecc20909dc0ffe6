//! In-memory handle for one cache generation.
//!
//! A `Generation` is shared as `Arc<Generation>` between the installer, the
//! activator and in-flight requests. Readers take a `Lease`; a generation can
//! only be evicted while no lease is held.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

use crate::cache::{GenerationRecord, RequestKey};
use crate::error::{CacheError, CacheResult};
use crate::manifest::{FetchPolicy, Manifest};

/// High bit of the reader word: set once the generation is evicted.
const EVICTED: usize = 1 << (usize::BITS - 1);

/// Generation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  Sealed,
  Current,
  Superseded,
  Evicted,
}

impl GenerationState {
  /// Whether moving from `self` to `next` is a legal lifecycle step.
  pub fn can_transition_to(self, next: GenerationState) -> bool {
    use GenerationState::*;
    matches!(
      (self, next),
      (Installing, Sealed)
        | (Sealed, Current)
        | (Sealed, Superseded)
        | (Current, Superseded)
        | (Superseded, Current)
        | (Superseded, Evicted)
    )
  }
}

impl fmt::Display for GenerationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Sealed => "sealed",
      Self::Current => "current",
      Self::Superseded => "superseded",
      Self::Evicted => "evicted",
    };
    f.write_str(name)
  }
}

pub struct Generation {
  version_id: String,
  policies: HashMap<RequestKey, FetchPolicy>,
  sealed_at: DateTime<Utc>,
  state: Mutex<GenerationState>,
  /// Active lease count, with the `EVICTED` bit on top
  readers: AtomicUsize,
}

impl Generation {
  /// Handle for a freshly sealed generation.
  pub fn sealed(
    version_id: impl Into<String>,
    policies: impl IntoIterator<Item = (RequestKey, FetchPolicy)>,
    sealed_at: DateTime<Utc>,
  ) -> Self {
    Self {
      version_id: version_id.into(),
      policies: policies.into_iter().collect(),
      sealed_at,
      state: Mutex::new(GenerationState::Sealed),
      readers: AtomicUsize::new(0),
    }
  }

  /// Rebuild a handle from a sealed stored generation.
  pub fn from_record(record: &GenerationRecord, origin: &Url) -> CacheResult<Self> {
    let sealed_at = match (record.is_sealed(), record.sealed_at) {
      (true, Some(at)) => at,
      _ => {
        return Err(CacheError::InvalidTransition {
          version_id: record.version_id.clone(),
          from: GenerationState::Installing.to_string(),
          to: GenerationState::Sealed.to_string(),
        })
      }
    };

    Self::from_manifest(&record.manifest, origin, sealed_at)
  }

  pub fn from_manifest(
    manifest: &Manifest,
    origin: &Url,
    sealed_at: DateTime<Utc>,
  ) -> CacheResult<Self> {
    Ok(Self::sealed(
      manifest.version_id.clone(),
      manifest.resolve(origin)?,
      sealed_at,
    ))
  }

  pub fn version_id(&self) -> &str {
    &self.version_id
  }

  pub fn sealed_at(&self) -> DateTime<Utc> {
    self.sealed_at
  }

  /// Policy the manifest declared for this key, if any
  pub fn policy_for(&self, key: &RequestKey) -> Option<FetchPolicy> {
    self.policies.get(key).copied()
  }

  pub fn state(&self) -> GenerationState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Move to `next`, returning the previous state.
  pub(crate) fn transition(&self, next: GenerationState) -> CacheResult<GenerationState> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let previous = *state;
    if !previous.can_transition_to(next) {
      return Err(CacheError::InvalidTransition {
        version_id: self.version_id.clone(),
        from: previous.to_string(),
        to: next.to_string(),
      });
    }
    *state = next;
    Ok(previous)
  }

  /// Number of leases currently held
  pub fn readers(&self) -> usize {
    self.readers.load(Ordering::Acquire) & !EVICTED
  }

  pub fn is_evicted(&self) -> bool {
    self.readers.load(Ordering::Acquire) & EVICTED != 0
  }

  /// Take a read lease. Fails only once the generation has been evicted.
  pub fn lease(self: &Arc<Self>) -> Option<Lease> {
    self
      .readers
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
        (word & EVICTED == 0).then_some(word + 1)
      })
      .ok()
      .map(|_| Lease {
        generation: Arc::clone(self),
      })
  }

  /// Claim the generation for eviction if nobody holds a lease.
  ///
  /// After this succeeds no new lease can be taken.
  pub(crate) fn try_mark_evicted(&self) -> bool {
    self
      .readers
      .compare_exchange(0, EVICTED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }
}

impl fmt::Debug for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Generation")
      .field("version_id", &self.version_id)
      .field("state", &self.state())
      .field("readers", &self.readers())
      .field("sealed_at", &self.sealed_at)
      .finish_non_exhaustive()
  }
}

/// Keeps a generation alive in storage while a request reads from it.
pub struct Lease {
  generation: Arc<Generation>,
}

impl Deref for Lease {
  type Target = Generation;

  fn deref(&self) -> &Generation {
    &self.generation
  }
}

impl Drop for Lease {
  fn drop(&mut self) {
    self.generation.readers.fetch_sub(1, Ordering::AcqRel);
  }
}
