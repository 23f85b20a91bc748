use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use url::Url;

use inkwell::app::App;
use inkwell::cache::{ControlRequest, ControlResponse};
use inkwell::config::Config;
use inkwell::http::Request;
use inkwell::logging;

#[derive(Parser, Debug)]
#[command(name = "inkwell")]
#[command(about = "Offline-tolerant write and sync pipeline for journal entries")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/inkwell/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a write
  Submit {
    /// Resource kind, e.g. journal_entry
    kind: String,
    /// JSON payload
    payload: String,
    /// Send now and wait for the server result
    #[arg(long)]
    wait: bool,
  },
  /// Send queued writes once and exit
  Sync,
  /// Keep syncing in the background until interrupted
  Run,
  /// Show unsent writes per kind
  Status,
  /// List queued writes
  List {
    #[arg(long)]
    kind: Option<String>,
  },
  /// Reset a failed write so it is retried from scratch
  Requeue { id: String },
  /// Fetch a path through the cache layer
  Fetch { path: String },
  /// Manage cache generations
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Print the active generation
  Version,
  /// Install a generation and delete all others
  Activate { generation: String },
  /// Drop cached pages and API responses
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config.data_dir()?.join("logs"), args.verbose)?;

  let app = App::open(config.clone())?;

  match args.command {
    Command::Submit {
      kind,
      payload,
      wait,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
      if !wait {
        let write = app.queue().enqueue(&kind, payload)?;
        println!("{}", write.id);
      } else if app.start().await?.is_none() {
        let write = app.queue().enqueue(&kind, payload)?;
        println!("{} queued, server unreachable", write.id);
      } else {
        let result = app
          .engine()
          .submit_write(&kind, payload)
          .await
          .map_err(|e| eyre!("{}", e))?;
        println!("{}", serde_json::to_string_pretty(&result)?);
      }
    }
    Command::Sync => {
      let before = app.queue().len()?;
      match app.sync_once().await? {
        Some(report) => {
          let after = app.queue().len()?;
          println!(
            "sent {} of {} queued writes ({} exhausted, {} left)",
            before.saturating_sub(after),
            before,
            report.exhausted,
            after
          );
        }
        None => println!("server unreachable, {} writes still queued", before),
      }
    }
    Command::Run => app.run().await?,
    Command::Status => {
      println!(
        "server: {}  cache generation: {}",
        config.server.url,
        app.interceptor().generation().tag()
      );
      let counts = app.queue().counts()?;
      if counts.is_empty() {
        println!("nothing pending sync");
      }
      for c in counts {
        println!(
          "{:<20} pending {:>4}  in flight {:>4}  failed {:>4}",
          c.resource_kind, c.pending, c.in_flight, c.failed
        );
      }
    }
    Command::List { kind } => {
      for w in app.queue().list(kind.as_deref())? {
        println!(
          "{}  {:<16} {:<9} retries {}  {}  {}",
          w.id,
          w.resource_kind,
          w.status.as_str(),
          w.retry_count,
          w.created_at.to_rfc3339(),
          w.payload
        );
      }
    }
    Command::Requeue { id } => {
      if app.queue().requeue(&id)? {
        println!("{} requeued", id);
      } else {
        return Err(eyre!("No failed write with id {}", id));
      }
    }
    Command::Fetch { path } => {
      let url = Url::parse(&config.server.url)
        .and_then(|origin| origin.join(&path))
        .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
      let result = app
        .interceptor()
        .fetch(&Request::get(url))
        .await
        .map_err(|e| eyre!("{}", e))?;
      eprintln!("HTTP {} ({})", result.data.status, result.source);
      println!("{}", result.data.text());
    }
    Command::Cache { action } => {
      let control = app.cache_control();
      let request = match action {
        CacheAction::Version => ControlRequest::GetVersion,
        CacheAction::Activate { generation } => ControlRequest::ActivateGeneration(generation),
        CacheAction::Clear => ControlRequest::ClearDynamic,
      };
      match control.call(request).await? {
        ControlResponse::Version(tag) => println!("{}", tag),
        ControlResponse::Activated { deleted } => {
          println!("activated, deleted {} stale partition(s)", deleted.len());
          for name in deleted {
            println!("  {}", name);
          }
        }
        ControlResponse::Cleared(count) => println!("cleared {} cached response(s)", count),
        ControlResponse::Error(e) => return Err(eyre!("Cache control failed: {}", e)),
      }
    }
  }

  Ok(())
}
