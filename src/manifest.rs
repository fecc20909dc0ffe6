//! Asset manifest: the declared set of resources a cache generation must hold.
//!
//! Manifests are produced by the deploy pipeline and consumed read-only:
//!
//! ```json
//! {
//!   "versionId": "v1",
//!   "entries": [
//!     { "key": "/index.html", "policy": "must-cache" },
//!     { "key": "/hero.png", "policy": "opportunistic" }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use url::Url;

use crate::cache::RequestKey;
use crate::error::{CacheError, CacheResult};

/// How an entry participates in generation sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
  /// Must be stored before the generation can seal; served cache-only
  MustCache,
  /// Best effort; served network-first
  Opportunistic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub key: String,
  pub policy: FetchPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
  pub version_id: String,
  pub entries: Vec<ManifestEntry>,
}

impl Manifest {
  /// Parse and validate a manifest document.
  pub fn from_json(json: &str) -> CacheResult<Self> {
    let manifest: Manifest =
      serde_json::from_str(json).map_err(|e| CacheError::ManifestInvalid(e.to_string()))?;
    manifest.validate()?;
    Ok(manifest)
  }

  pub fn from_path(path: &Path) -> CacheResult<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      CacheError::ManifestInvalid(format!("failed to read {}: {}", path.display(), e))
    })?;
    Self::from_json(&contents)
  }

  fn validate(&self) -> CacheResult<()> {
    if self.version_id.trim().is_empty() {
      return Err(CacheError::ManifestInvalid(
        "versionId must not be empty".to_string(),
      ));
    }

    let mut seen = HashSet::new();
    for entry in &self.entries {
      if entry.key.trim().is_empty() {
        return Err(CacheError::ManifestInvalid(format!(
          "empty key in {}",
          self.version_id
        )));
      }
      if !seen.insert(entry.key.trim()) {
        return Err(CacheError::ManifestInvalid(format!(
          "duplicate key {}",
          entry.key
        )));
      }
    }

    Ok(())
  }

  /// Resolve every entry against the origin.
  ///
  /// Fails if two entries canonicalize to the same request key.
  pub fn resolve(&self, origin: &Url) -> CacheResult<Vec<(RequestKey, FetchPolicy)>> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(self.entries.len());

    for entry in &self.entries {
      let key = RequestKey::resolve(origin, "GET", &entry.key)?;
      if !seen.insert(key.clone()) {
        return Err(CacheError::ManifestInvalid(format!(
          "{} resolves to an already declared key {}",
          entry.key, key
        )));
      }
      resolved.push((key, entry.policy));
    }

    Ok(resolved)
  }

  pub fn must_cache_count(&self) -> usize {
    self
      .entries
      .iter()
      .filter(|e| e.policy == FetchPolicy::MustCache)
      .count()
  }

  /// SHA256 fingerprint of the canonical document
  pub fn digest(&self) -> String {
    let canonical = serde_json::to_vec(self).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
  }
}
