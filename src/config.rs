use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{offline_response, InterceptSettings, UnmatchedPolicy};
use crate::install::{InstallSettings, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  /// Origin that relative manifest keys and request URLs resolve against
  pub origin: Url,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub install: InstallConfig,
  #[serde(default)]
  pub intercept: InterceptConfig,
  #[serde(default)]
  pub fallback: FallbackConfig,
  #[serde(default)]
  pub eviction: EvictionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Total stored body bytes before writes fail with StorageFull
  pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  pub max_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub fetch_timeout_ms: u64,
  pub concurrency: usize,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff_ms: 200,
      max_backoff_ms: 5_000,
      fetch_timeout_ms: 10_000,
      concurrency: 4,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  pub network_timeout_ms: u64,
  /// Strategy for requests the manifest does not list: network-first or cache-first
  pub unmatched: UnmatchedPolicy,
  pub backfill: bool,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      network_timeout_ms: 3_000,
      unmatched: UnmatchedPolicy::default(),
      backfill: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
  pub status: u16,
  pub content_type: String,
  /// Inline body; `body_file` wins when both are set
  pub body: Option<String>,
  pub body_file: Option<PathBuf>,
}

impl Default for FallbackConfig {
  fn default() -> Self {
    Self {
      status: 503,
      content_type: "text/html; charset=utf-8".to_string(),
      body: None,
      body_file: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
  /// How often superseded generations that were still in use are retried
  pub sweep_interval_ms: u64,
}

impl Default for EvictionConfig {
  fn default() -> Self {
    Self {
      sweep_interval_ms: 60_000,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Without a file, `origin_override` alone is enough to run with defaults.
  pub fn load(explicit_path: Option<&Path>, origin_override: Option<Url>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match (path, origin_override) {
      (Some(p), origin) => {
        let mut config = Self::load_from_path(&p)?;
        if let Some(origin) = origin {
          config.origin = origin;
        }
        config
      }
      (None, Some(origin)) => Self::with_origin(origin),
      (None, None) => {
        return Err(eyre!(
          "No configuration file found. Create ~/.config/swcache/config.yaml \
           or pass --origin."
        ))
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml_str(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Defaults for everything except the origin
  pub fn with_origin(origin: Url) -> Self {
    Self {
      origin,
      storage: StorageConfig::default(),
      install: InstallConfig::default(),
      intercept: InterceptConfig::default(),
      fallback: FallbackConfig::default(),
      eviction: EvictionConfig::default(),
    }
  }

  fn validate(&self) -> Result<()> {
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) URL: {}", self.origin));
    }
    if self.install.max_attempts == 0 {
      return Err(eyre!("install.max_attempts must be at least 1"));
    }
    if self.install.concurrency == 0 {
      return Err(eyre!("install.concurrency must be at least 1"));
    }
    if self.eviction.sweep_interval_ms == 0 {
      return Err(eyre!("eviction.sweep_interval_ms must be positive"));
    }
    Ok(())
  }

  pub fn install_settings(&self) -> InstallSettings {
    InstallSettings {
      retry: RetryPolicy {
        max_attempts: self.install.max_attempts,
        initial_backoff: Duration::from_millis(self.install.initial_backoff_ms),
        max_backoff: Duration::from_millis(self.install.max_backoff_ms),
      },
      fetch_timeout: Duration::from_millis(self.install.fetch_timeout_ms),
      concurrency: self.install.concurrency,
    }
  }

  pub fn intercept_settings(&self) -> Result<InterceptSettings> {
    let defaults = InterceptSettings::default();
    let fallback = match (&self.fallback.body_file, &self.fallback.body) {
      (Some(path), _) => {
        let body = std::fs::read_to_string(path)
          .map_err(|e| eyre!("Failed to read fallback body {}: {}", path.display(), e))?;
        offline_response(self.fallback.status, &self.fallback.content_type, &body)
      }
      (None, Some(body)) => offline_response(self.fallback.status, &self.fallback.content_type, body),
      (None, None) => {
        let mut response = defaults.fallback;
        response.status = self.fallback.status;
        response
      }
    };

    Ok(InterceptSettings {
      network_timeout: Duration::from_millis(self.intercept.network_timeout_ms),
      unmatched: self.intercept.unmatched,
      backfill: self.intercept.backfill,
      fallback,
    })
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.eviction.sweep_interval_ms)
  }
}
