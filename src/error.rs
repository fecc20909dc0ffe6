//! Error types for the caching core.
//!
//! Every fallible operation returns `CacheResult<T>`. Errors are `Clone` so a
//! single install failure can be handed to every caller that joined it.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors the caching core can report
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  // Install errors
  #[error("Install of {version_id} aborted: {key}: {reason}")]
  InstallAborted {
    version_id: String,
    key: String,
    reason: String,
  },

  // Storage errors
  #[error("Storage full while writing {key} into {version_id}")]
  StorageFull { version_id: String, key: String },

  #[error("Storage write failed: {context}: {reason}")]
  WriteError { context: String, reason: String },

  #[error("Generation not found: {0}")]
  GenerationNotFound(String),

  #[error("Generation {0} is sealed and cannot be written")]
  GenerationSealed(String),

  #[error("Invalid generation transition for {version_id}: {from} -> {to}")]
  InvalidTransition {
    version_id: String,
    from: String,
    to: String,
  },

  // Network errors
  #[error("Request to {url} timed out after {}ms", .timeout.as_millis())]
  NetworkTimeout { url: String, timeout: Duration },

  #[error("Network error for {url}: {reason}")]
  Network { url: String, reason: String },

  #[error("Unexpected status {status} from {url}")]
  HttpStatus { url: String, status: u16 },

  // Input errors
  #[error("Invalid manifest: {0}")]
  ManifestInvalid(String),

  #[error("Invalid URL {url}: {reason}")]
  InvalidUrl { url: String, reason: String },

  // General errors
  #[error("Internal error: {0}")]
  Internal(String),
}

impl CacheError {
  /// Create a storage write error with context
  pub fn write(context: impl Into<String>, reason: impl ToString) -> Self {
    Self::WriteError {
      context: context.into(),
      reason: reason.to_string(),
    }
  }

  /// Check if a fetch that failed with this error is worth retrying
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Self::NetworkTimeout { .. } | Self::Network { .. } | Self::HttpStatus { .. }
    )
  }
}
