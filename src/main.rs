mod event;

use campus_relay::cache::CachedResource;
use campus_relay::logging::{self, LogConfig, LogLevel};
use campus_relay::queue::{ActionKind, Operation, SyncOutcome};
use campus_relay::{Config, OfflineManager};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use event::{Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "campus-relay")]
#[command(about = "Push notifications, offline action queue and resource cache for the campus client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/campus-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
  log_level: LogLevel,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connect to a channel and print pushed messages as JSON lines until Ctrl-C
  Listen {
    #[arg(long, default_value = "teacher")]
    channel: String,
    #[arg(long)]
    identity: String,
  },
  /// Inspect or edit the offline action queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Replay queued actions against the server
  Sync,
  /// Inspect or edit the resource cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Record an action
  Add {
    /// highlight, note, view_record or any custom kind
    #[arg(long)]
    kind: String,
    /// create, update or delete
    #[arg(long)]
    operation: String,
    /// JSON object payload
    #[arg(long, default_value = "{}")]
    payload: String,
  },
  /// List unsynced actions
  List {
    /// Only actions that ran out of retries
    #[arg(long)]
    exhausted: bool,
  },
  /// Give an exhausted action a fresh set of retries
  Retry { id: String },
  /// Drop an action without syncing it
  Discard { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Cache a file's contents
  Put {
    file: PathBuf,
    /// Resource id (default: SHA-256 of the contents)
    #[arg(long)]
    id: Option<String>,
  },
  /// Write a cached resource to stdout or a file
  Get {
    id: String,
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Drop one cached resource
  Remove { id: String },
  Stats,
  /// Expire entries older than the given number of seconds
  Cleanup {
    #[arg(long)]
    max_age_secs: u64,
  },
  Clear,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string(value)?);
  Ok(())
}

async fn listen(manager: &OfflineManager, channel: &str, identity: &str) -> Result<()> {
  let mut events = EventHandler::new(Duration::from_secs(30), manager.subscribe_status());
  let handle = manager.connect(channel, identity, events.message_handler())?;
  info!(connection = %handle.key(), "listening");

  while let Some(event) = events.next().await {
    match event {
      Event::Push { key, message } => print_json(&json!({
        "channel": key.channel,
        "identity": key.identity,
        "message": message.to_value(),
      }))?,
      Event::Status(change) => {
        info!(connection = %change.key, from = ?change.from, to = ?change.to, "status changed")
      }
      Event::Tick => debug!(status = ?handle.status(), queued = manager.queue().len()?, "tick"),
      Event::Shutdown => break,
    }
  }
  Ok(())
}

async fn run(manager: &OfflineManager, command: Command) -> Result<()> {
  match command {
    Command::Listen { channel, identity } => listen(manager, &channel, &identity).await?,

    Command::Queue(QueueCommand::Add {
      kind,
      operation,
      payload,
    }) => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let operation: Operation = operation.parse()?;
      let action = manager.add_to_queue(ActionKind::from(kind), operation, payload)?;
      print_json(&action)?;
    }
    Command::Queue(QueueCommand::List { exhausted }) => {
      let actions = if exhausted {
        manager.queue().exhausted()?
      } else {
        manager.queue().pending()?
      };
      for action in &actions {
        print_json(action)?;
      }
    }
    Command::Queue(QueueCommand::Retry { id }) => {
      if !manager.queue().reset_retries(&id)? {
        return Err(eyre!("No unsynced action with id {}", id));
      }
    }
    Command::Queue(QueueCommand::Discard { id }) => {
      if !manager.queue().discard(&id)? {
        return Err(eyre!("No action with id {}", id));
      }
    }

    Command::Sync => match manager.sync_offline_queue().await? {
      SyncOutcome::Completed(summary) => print_json(&summary)?,
      SyncOutcome::AlreadyRunning => eprintln!("A sync is already running"),
    },

    Command::Cache(CacheCommand::Put { file, id }) => {
      let payload = std::fs::read(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let resource = match id {
        Some(id) => CachedResource::new(id, payload),
        None => CachedResource::content_addressed(payload),
      };
      let receipt = manager.cache_resource(&resource)?;
      print_json(&json!({
        "id": resource.id,
        "size": resource.size,
        "replaced": receipt.replaced,
        "evicted": receipt.evicted,
      }))?;
    }
    Command::Cache(CacheCommand::Get { id, output }) => {
      let resource = manager
        .get_cached_resource(&id)?
        .ok_or_else(|| eyre!("{} is not cached", id))?;
      match output {
        Some(path) => std::fs::write(&path, &resource.payload)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => {
          use std::io::Write;
          std::io::stdout().write_all(&resource.payload)?;
        }
      }
    }
    Command::Cache(CacheCommand::Remove { id }) => {
      if !manager.remove_cached_resource(&id)? {
        return Err(eyre!("{} is not cached", id));
      }
    }
    Command::Cache(CacheCommand::Stats) => print_json(&manager.get_cache_stats()?)?,
    Command::Cache(CacheCommand::Cleanup { max_age_secs }) => {
      let expired = manager.cleanup_cache(chrono::Duration::seconds(max_age_secs as i64))?;
      print_json(&json!({ "expired": expired }))?;
    }
    Command::Cache(CacheCommand::Clear) => manager.clear_cache()?,
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  logging::init(&LogConfig {
    level: args.log_level,
    file: args.log_file.clone(),
  })?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let manager = OfflineManager::init(config)?;
  let result = run(&manager, args.command).await;
  manager.shutdown().await;

  result
}
