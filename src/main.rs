use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use offline_cache::adapter;
use offline_cache::config::{Config, StorageBackend};
use offline_cache::db::Database;
use offline_cache::http::{Method, Request, RequestMode};
use offline_cache::{CacheEngine, ControlCommand, HttpFetcher};

/// How long shutdown waits for background refreshes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Offline caching and background-sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-cache.yaml or $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep cache and queue in memory for this run only
  #[arg(long)]
  memory: bool,

  /// Write logs to a daily rolling file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send one request through the engine
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,

    /// Treat the request as a top-level page load
    #[arg(long)]
    navigate: bool,

    /// Request header as `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },

  /// Run a control command given as JSON, e.g. '{"type":"GET_VERSION"}'
  Control { command: String },

  /// Show per-bucket cache statistics
  Stats,

  /// Replay the sync queue once
  Sync,

  /// List queued requests
  Queue,

  /// Delete expired cache entries
  Cleanup,

  /// Answer JSON-lines messages on stdin until end of input
  Serve,
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  // RUST_LOG controls the level (e.g. RUST_LOG=offline_cache=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::daily(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      Ok(None)
    }
  }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Header must look like 'name: value': {}", raw))?;
  Ok((name.trim().to_string(), value.trim().to_string()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", json);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.memory {
    config.storage.backend = StorageBackend::Memory;
  }

  // The sync queue always lives in the database, so --memory also makes it ephemeral
  let db = if args.memory {
    Database::open_in_memory()?
  } else {
    Database::open(&config.database_path()?)?
  };
  let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
  let engine = Arc::new(CacheEngine::new(config, fetcher, &db)?);

  let result = run(&engine, args.command).await;
  engine.shutdown(SHUTDOWN_GRACE).await;
  result
}

async fn run(engine: &Arc<CacheEngine>, command: Command) -> Result<()> {
  match command {
    Command::Fetch {
      url,
      method,
      navigate,
      headers,
      data,
    } => {
      let mut request = Request::new(method, engine.config().resolve_url(&url)?);
      if navigate {
        request.mode = RequestMode::Navigate;
      }
      for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
      }
      if let Some(body) = data {
        request = request.with_body(body);
      }

      let response = engine.handle(request).await?;
      eprintln!("{} ({:?})", response.status, response.source);
      for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
      }
      println!("{}", String::from_utf8_lossy(&response.body));
    }

    Command::Control { command } => {
      let command: ControlCommand =
        serde_json::from_str(&command).map_err(|e| eyre!("Invalid control command: {}", e))?;
      print_json(&engine.handle_control(command).await)?;
    }

    Command::Stats => {
      for bucket in engine.stats()? {
        let ttl = bucket
          .ttl_secs
          .map(|s| format!("{}s", s))
          .unwrap_or_else(|| "never".to_string());
        println!(
          "{:<8} {:>4}/{:<4} ttl {}",
          bucket.bucket, bucket.count, bucket.max_entries, ttl
        );
        for entry in &bucket.entries {
          let marker = if entry.expired { " (expired)" } else { "" };
          println!("  {} {}{}", entry.stored_at.to_rfc3339(), entry.key, marker);
        }
      }
    }

    Command::Sync => match engine.handle_sync_trigger().await? {
      Some(summary) => println!("Synced {}/{}", summary.synced, summary.total),
      None => println!("A sync pass is already running"),
    },

    Command::Queue => {
      for item in engine.queue().dequeue_all()? {
        println!(
          "{:>5} {} {:<7} {} ({} bytes)",
          item.id,
          item.enqueued_at.to_rfc3339(),
          item.method,
          item.url,
          item.body.len()
        );
      }
    }

    Command::Cleanup => {
      let removed = engine.cleanup_expired()?;
      println!("Removed {} expired entries", removed);
    }

    Command::Serve => {
      engine.install().await?;
      engine.activate()?;

      let interval = Duration::from_secs(engine.config().maintenance.interval_secs.max(1));
      let maintenance = engine.spawn_maintenance(interval);
      info!(version = %engine.config().version, "Serving on stdin/stdout");

      let stdin = tokio::io::BufReader::new(tokio::io::stdin());
      let handled = adapter::serve(engine, stdin, tokio::io::stdout()).await?;
      info!(handled, "Input closed");
      maintenance.abort();
    }
  }

  Ok(())
}
