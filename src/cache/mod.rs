//! Generation-scoped response cache and the request interceptor in front of it.
//!
//! This module provides:
//! - Canonical request keys (method + absolute URL)
//! - Durable, versioned storage of response snapshots (SQLite)
//! - The interceptor that answers requests from the current generation,
//!   the network, or an offline fallback

mod layer;
mod storage;
mod types;

pub use layer::{offline_response, InterceptSettings, Interceptor, UnmatchedPolicy};
pub use storage::{CacheStorage, GenerationRecord, SqliteStorage, StoredState};
pub use types::{CacheSource, Request, RequestKey, Response, Served, StoredResponse};
