//! Cache storage trait and SQLite implementation.
//!
//! Storage is append-within-generation and delete-whole-generation only.
//! Manifest entries can be written while a generation is installing; once it
//! is sealed only runtime side entries may be added next to them.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::types::{RequestKey, Response, StoredResponse};
use crate::error::{CacheError, CacheResult};
use crate::manifest::Manifest;

/// Persisted lifecycle state of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredState {
  Installing,
  Sealed,
}

impl StoredState {
  fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Sealed => "sealed",
    }
  }

  fn parse(s: &str) -> CacheResult<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "sealed" => Ok(Self::Sealed),
      other => Err(CacheError::Internal(format!(
        "unknown generation state '{}'",
        other
      ))),
    }
  }
}

/// Metadata for one stored generation.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
  pub version_id: String,
  pub state: StoredState,
  pub manifest: Manifest,
  pub manifest_digest: String,
  pub created_at: DateTime<Utc>,
  pub sealed_at: Option<DateTime<Utc>>,
  /// Manifest and runtime entries currently stored
  pub entry_count: usize,
}

impl GenerationRecord {
  pub fn is_sealed(&self) -> bool {
    self.state == StoredState::Sealed
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Start a new generation in the installing state.
  ///
  /// A leftover installing generation with the same id is discarded first.
  fn create_generation(&self, manifest: &Manifest) -> CacheResult<()>;

  /// Store a manifest entry into an installing generation.
  fn put(&self, version_id: &str, key: &RequestKey, response: &StoredResponse) -> CacheResult<()>;

  /// Store a backfilled side entry. Never replaces a manifest entry.
  fn put_runtime(
    &self,
    version_id: &str,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> CacheResult<()>;

  /// Look up an entry in a generation.
  fn get(&self, version_id: &str, key: &RequestKey) -> CacheResult<Option<StoredResponse>>;

  /// Mark an installing generation as sealed.
  fn seal_generation(&self, version_id: &str) -> CacheResult<DateTime<Utc>>;

  /// Delete a generation and all its entries. Deleting a missing generation is ok.
  fn delete_generation(&self, version_id: &str) -> CacheResult<()>;

  fn load_generation(&self, version_id: &str) -> CacheResult<Option<GenerationRecord>>;

  /// All stored generations, oldest first.
  fn list_generations(&self) -> CacheResult<Vec<GenerationRecord>>;

  /// Set of stored generation ids.
  #[cfg(test)]
  fn generation_ids(&self) -> CacheResult<Vec<String>> {
    Ok(
      self
        .list_generations()?
        .into_iter()
        .map(|g| g.version_id)
        .collect(),
    )
  }

  /// Read the durable current pointer.
  fn current(&self) -> CacheResult<Option<String>>;

  /// Replace the durable current pointer.
  fn set_current(&self, version_id: Option<&str>) -> CacheResult<()>;

  /// Delete every generation that never sealed and return their ids.
  fn purge_unsealed(&self) -> CacheResult<Vec<String>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  /// Upper bound on stored body bytes, if any
  max_bytes: Option<u64>,
}

impl SqliteStorage {
  /// Open (or create) the store at the given path.
  pub fn open(path: &Path) -> CacheResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::write("creating cache directory", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| CacheError::write(format!("opening {}", path.display()), e))?;

    debug!(path = %path.display(), "opened cache database");
    Self::from_connection(conn)
  }

  /// Open a store that lives only as long as this value.
  #[cfg(test)]
  pub fn open_in_memory() -> CacheResult<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| CacheError::write("opening in-memory store", e))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> CacheResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Internal("could not determine data directory".to_string()))?;

    Ok(data_dir.join("swcache").join("cache.db"))
  }

  /// Limit the total number of body bytes the store accepts.
  pub fn with_quota(mut self, max_bytes: Option<u64>) -> Self {
    self.max_bytes = max_bytes;
    self
  }

  fn from_connection(conn: Connection) -> CacheResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      max_bytes: None,
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn conn(&self) -> CacheResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Internal(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> CacheResult<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| CacheError::write("running cache migrations", e))
  }

  fn ensure_quota(
    &self,
    conn: &Connection,
    version_id: &str,
    key: &RequestKey,
    incoming: usize,
  ) -> CacheResult<()> {
    let Some(max_bytes) = self.max_bytes else {
      return Ok(());
    };

    let used: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(body)), 0) FROM entries",
        [],
        |row| row.get(0),
      )
      .map_err(|e| CacheError::write("measuring store size", e))?;

    if used as u64 + incoming as u64 > max_bytes {
      return Err(CacheError::StorageFull {
        version_id: version_id.to_string(),
        key: key.to_string(),
      });
    }
    Ok(())
  }

  fn state_of(conn: &Connection, version_id: &str) -> CacheResult<Option<StoredState>> {
    let state: Option<String> = conn
      .query_row(
        "SELECT state FROM generations WHERE version_id = ?",
        params![version_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| CacheError::write("reading generation state", e))?;

    state.as_deref().map(StoredState::parse).transpose()
  }

  fn insert_entry(
    conn: &Connection,
    sql: &str,
    version_id: &str,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> CacheResult<()> {
    let headers = serde_json::to_string(&response.response.headers)
      .map_err(|e| CacheError::write("serializing headers", e))?;

    conn
      .execute(
        sql,
        params![
          version_id,
          key.to_string(),
          response.response.status,
          headers,
          response.response.body,
          format_datetime(response.stored_at),
        ],
      )
      .map_err(|e| storage_error("storing entry", version_id, key, e))?;

    Ok(())
  }

  fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
      version_id: row.get(0)?,
      state: row.get(1)?,
      manifest: row.get(2)?,
      manifest_digest: row.get(3)?,
      created_at: row.get(4)?,
      sealed_at: row.get(5)?,
      entry_count: row.get(6)?,
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- One row per generation (manifest version)
CREATE TABLE IF NOT EXISTS generations (
    version_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    manifest TEXT NOT NULL,
    manifest_digest TEXT NOT NULL,
    created_at TEXT NOT NULL,
    sealed_at TEXT
);

-- Response snapshots; kind is 'manifest' or 'runtime'
CREATE TABLE IF NOT EXISTS entries (
    version_id TEXT NOT NULL,
    request_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (version_id, request_key),
    FOREIGN KEY (version_id) REFERENCES generations(version_id) ON DELETE CASCADE
);

-- Single-row durable current pointer
CREATE TABLE IF NOT EXISTS current_pointer (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version_id TEXT
);
"#;

const GENERATION_COLUMNS: &str = "g.version_id, g.state, g.manifest, g.manifest_digest, g.created_at, g.sealed_at,
   (SELECT COUNT(*) FROM entries e WHERE e.version_id = g.version_id)";

/// Row as read from SQLite, before parsing.
struct RawRecord {
  version_id: String,
  state: String,
  manifest: String,
  manifest_digest: String,
  created_at: String,
  sealed_at: Option<String>,
  entry_count: i64,
}

impl RawRecord {
  fn parse(self) -> CacheResult<GenerationRecord> {
    let manifest: Manifest = serde_json::from_str(&self.manifest)
      .map_err(|e| CacheError::Internal(format!("corrupt manifest for {}: {}", self.version_id, e)))?;

    Ok(GenerationRecord {
      state: StoredState::parse(&self.state)?,
      manifest,
      manifest_digest: self.manifest_digest,
      created_at: parse_datetime(&self.created_at)?,
      sealed_at: self.sealed_at.as_deref().map(parse_datetime).transpose()?,
      entry_count: self.entry_count.max(0) as usize,
      version_id: self.version_id,
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn create_generation(&self, manifest: &Manifest) -> CacheResult<()> {
    let conn = self.conn()?;
    let version_id = manifest.version_id.as_str();

    match Self::state_of(&conn, version_id)? {
      Some(StoredState::Sealed) => return Err(CacheError::GenerationSealed(version_id.to_string())),
      Some(StoredState::Installing) => {
        info!(version_id, "discarding leftover partial generation");
        conn
          .execute(
            "DELETE FROM generations WHERE version_id = ?",
            params![version_id],
          )
          .map_err(|e| CacheError::write("discarding partial generation", e))?;
      }
      None => {}
    }

    let manifest_json = serde_json::to_string(manifest)
      .map_err(|e| CacheError::write("serializing manifest", e))?;

    conn
      .execute(
        "INSERT INTO generations (version_id, state, manifest, manifest_digest, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          version_id,
          StoredState::Installing.as_str(),
          manifest_json,
          manifest.digest(),
          format_datetime(Utc::now()),
        ],
      )
      .map_err(|e| CacheError::write("creating generation", e))?;

    Ok(())
  }

  fn put(&self, version_id: &str, key: &RequestKey, response: &StoredResponse) -> CacheResult<()> {
    let conn = self.conn()?;

    match Self::state_of(&conn, version_id)? {
      None => return Err(CacheError::GenerationNotFound(version_id.to_string())),
      Some(StoredState::Sealed) => return Err(CacheError::GenerationSealed(version_id.to_string())),
      Some(StoredState::Installing) => {}
    }

    self.ensure_quota(&conn, version_id, key, response.response.body.len())?;

    Self::insert_entry(
      &conn,
      "INSERT OR REPLACE INTO entries (version_id, request_key, kind, status, headers, body, stored_at)
       VALUES (?, ?, 'manifest', ?, ?, ?, ?)",
      version_id,
      key,
      response,
    )
  }

  fn put_runtime(
    &self,
    version_id: &str,
    key: &RequestKey,
    response: &StoredResponse,
  ) -> CacheResult<()> {
    let conn = self.conn()?;

    if Self::state_of(&conn, version_id)?.is_none() {
      return Err(CacheError::GenerationNotFound(version_id.to_string()));
    }

    self.ensure_quota(&conn, version_id, key, response.response.body.len())?;

    Self::insert_entry(
      &conn,
      "INSERT INTO entries (version_id, request_key, kind, status, headers, body, stored_at)
       VALUES (?, ?, 'runtime', ?, ?, ?, ?)
       ON CONFLICT (version_id, request_key) DO UPDATE SET
         status = excluded.status,
         headers = excluded.headers,
         body = excluded.body,
         stored_at = excluded.stored_at
       WHERE entries.kind = 'runtime'",
      version_id,
      key,
      response,
    )
  }

  fn get(&self, version_id: &str, key: &RequestKey) -> CacheResult<Option<StoredResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries
         WHERE version_id = ? AND request_key = ?",
        params![version_id, key.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| CacheError::write("reading entry", e))?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| CacheError::Internal(format!("corrupt headers for {}: {}", key, e)))?;
        Ok(Some(StoredResponse {
          response: Response {
            status,
            headers,
            body,
          },
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn seal_generation(&self, version_id: &str) -> CacheResult<DateTime<Utc>> {
    let conn = self.conn()?;
    let sealed_at = Utc::now();

    let updated = conn
      .execute(
        "UPDATE generations SET state = ?, sealed_at = ?
         WHERE version_id = ? AND state = ?",
        params![
          StoredState::Sealed.as_str(),
          format_datetime(sealed_at),
          version_id,
          StoredState::Installing.as_str(),
        ],
      )
      .map_err(|e| CacheError::write("sealing generation", e))?;

    if updated == 0 {
      return match Self::state_of(&conn, version_id)? {
        None => Err(CacheError::GenerationNotFound(version_id.to_string())),
        Some(_) => Err(CacheError::GenerationSealed(version_id.to_string())),
      };
    }

    Ok(sealed_at)
  }

  fn delete_generation(&self, version_id: &str) -> CacheResult<()> {
    self
      .conn()?
      .execute(
        "DELETE FROM generations WHERE version_id = ?",
        params![version_id],
      )
      .map_err(|e| CacheError::write("deleting generation", e))?;
    Ok(())
  }

  fn load_generation(&self, version_id: &str) -> CacheResult<Option<GenerationRecord>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM generations g WHERE g.version_id = ?",
      GENERATION_COLUMNS
    );

    let raw = conn
      .query_row(&sql, params![version_id], Self::read_record)
      .optional()
      .map_err(|e| CacheError::write("loading generation", e))?;

    raw.map(RawRecord::parse).transpose()
  }

  fn list_generations(&self) -> CacheResult<Vec<GenerationRecord>> {
    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM generations g ORDER BY g.created_at",
      GENERATION_COLUMNS
    );

    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| CacheError::write("preparing generation listing", e))?;

    let raw: Vec<RawRecord> = stmt
      .query_map([], Self::read_record)
      .map_err(|e| CacheError::write("listing generations", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| CacheError::write("listing generations", e))?;

    raw.into_iter().map(RawRecord::parse).collect()
  }

  fn current(&self) -> CacheResult<Option<String>> {
    let value: Option<Option<String>> = self
      .conn()?
      .query_row(
        "SELECT version_id FROM current_pointer WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| CacheError::write("reading current pointer", e))?;

    Ok(value.flatten())
  }

  fn set_current(&self, version_id: Option<&str>) -> CacheResult<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO current_pointer (id, version_id) VALUES (1, ?)",
        params![version_id],
      )
      .map_err(|e| CacheError::write("writing current pointer", e))?;
    Ok(())
  }

  fn purge_unsealed(&self) -> CacheResult<Vec<String>> {
    let conn = self.conn()?;

    let ids: Vec<String> = {
      let mut stmt = conn
        .prepare("SELECT version_id FROM generations WHERE state = ?")
        .map_err(|e| CacheError::write("preparing purge", e))?;
      let rows = stmt
        .query_map(params![StoredState::Installing.as_str()], |row| row.get(0))
        .map_err(|e| CacheError::write("finding partial generations", e))?;
      rows
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| CacheError::write("finding partial generations", e))?
    };

    conn
      .execute(
        "DELETE FROM generations WHERE state = ?",
        params![StoredState::Installing.as_str()],
      )
      .map_err(|e| CacheError::write("purging partial generations", e))?;

    Ok(ids)
  }
}

/// Map a SQLite failure, surfacing a full disk as `StorageFull`.
fn storage_error(context: &str, version_id: &str, key: &RequestKey, e: rusqlite::Error) -> CacheError {
  match &e {
    rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::DiskFull => {
      CacheError::StorageFull {
        version_id: version_id.to_string(),
        key: key.to_string(),
      }
    }
    _ => CacheError::write(context, e),
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp as written by `format_datetime`.
fn parse_datetime(s: &str) -> CacheResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| CacheError::Internal(format!("Failed to parse datetime '{}': {}", s, e)))
}
