mod activate;
mod bridge;
mod cache;
mod config;
mod error;
mod fetch;
mod generation;
mod install;
mod manifest;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{CacheSource, Request, SqliteStorage};
use fetch::HttpFetcher;
use manifest::Manifest;
use worker::CacheWorker;

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Versioned offline cache with atomic generation swaps")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin to resolve relative URLs against (overrides the config file)
  #[arg(long, global = true)]
  origin: Option<Url>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install a manifest, make it current and evict unused generations
  Install {
    /// Asset manifest (JSON)
    manifest: PathBuf,
  },
  /// Answer a request the way a client context would see it
  Get {
    url: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Deadline for the network leg
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Extra request header, as `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Print status line and headers before the body
    #[arg(short = 'i', long)]
    include: bool,
  },
  /// List stored generations
  Status {
    #[arg(long)]
    json: bool,
  },
  /// Delete superseded generations nobody is reading
  Evict,
}

fn init_tracing(verbose: u8) -> WorkerGuard {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("swcache=warn"),
    1 => EnvFilter::new("swcache=info"),
    _ => EnvFilter::new("swcache=debug"),
  });

  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_writer(writer)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose);

  let config = config::Config::load(args.config.as_deref(), args.origin)?;

  let path = match &config.storage.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  debug!(path = %path.display(), origin = %config.origin, "opening cache");
  let storage = Arc::new(SqliteStorage::open(&path)?.with_quota(config.storage.max_bytes));

  let worker = CacheWorker::new(
    storage,
    Arc::new(HttpFetcher::new()?),
    config.origin.clone(),
    config.install_settings(),
    config.intercept_settings()?,
  );
  worker.start().await?;

  match args.command {
    Command::Install { manifest } => {
      let manifest = Manifest::from_path(&manifest)?;
      let mut page = worker.subscribe();

      let sweeper = worker.spawn_eviction_sweeper(config.sweep_interval());
      let generation = worker.update(manifest).await?;
      sweeper.abort();

      println!("installed {}", generation.version_id());
      // Already current before this run: nothing is announced
      if let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(100), page.recv()).await {
        println!("{}", serde_json::to_string(&message)?);
      }
    }
    Command::Get {
      url,
      method,
      timeout_ms,
      headers,
      include,
    } => {
      let mut request = Request::new(&method, &url);
      if let Some(ms) = timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
      }
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected 'name: value'", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let served = worker.handle(request).await;
      let from = match (served.source, &served.version_id, served.cached_at) {
        (CacheSource::Cache, Some(version_id), Some(cached_at)) => format!(
          "cache ({}, stored {})",
          version_id,
          cached_at.format("%Y-%m-%d %H:%M:%S")
        ),
        (source, _, _) => source.to_string(),
      };
      eprintln!(
        "{} {} from {}",
        served.response.status,
        served.response.header("content-type").unwrap_or("-"),
        from
      );

      let mut out = std::io::stdout().lock();
      if include {
        writeln!(out, "HTTP {}", served.response.status)?;
        for (name, value) in &served.response.headers {
          writeln!(out, "{}: {}", name, value)?;
        }
        writeln!(out)?;
      }
      out.write_all(&served.response.body)?;
      out.flush()?;
    }
    Command::Status { json } => {
      let status = worker.status().await?;
      if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
      }

      println!(
        "current: {}",
        status.current.as_deref().unwrap_or("(none)")
      );
      for generation in &status.generations {
        println!(
          "{:<24} {:<11} {:>6} entries  created {}",
          generation.version_id,
          generation.state,
          generation.entries,
          generation.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
    Command::Evict => {
      let evicted = worker.evict().await?;
      if evicted.is_empty() {
        println!("nothing to evict");
      }
      for version_id in evicted {
        println!("evicted {}", version_id);
      }
    }
  }

  Ok(())
}
