use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  /// Channel name -> endpoint path, `{identity}` is substituted per connection
  #[serde(default = "default_channels")]
  pub channels: BTreeMap<String, String>,
  #[serde(default)]
  pub transport: TransportConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// HTTP API root, e.g. "https://school.example.com/api"
  pub base_url: String,
  /// WebSocket root; derived from `base_url` when unset
  pub ws_url: Option<String>,
}

impl ServerConfig {
  /// WebSocket root with the http(s) scheme swapped for ws(s).
  pub fn ws_root(&self) -> String {
    match &self.ws_url {
      Some(url) => url.trim_end_matches('/').to_string(),
      None => self
        .base_url
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1),
    }
  }
}

fn default_channels() -> BTreeMap<String, String> {
  let mut channels = BTreeMap::new();
  channels.insert("teacher".to_string(), "/ws/teacher/{identity}".to_string());
  channels.insert("documents".to_string(), "/ws/documents/{identity}".to_string());
  channels
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
  /// Discard the oldest pending message to make room
  #[default]
  DropOldest,
  /// Refuse the new message
  Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub backoff_multiplier: u32,
  pub heartbeat_interval_secs: u64,
  pub heartbeat_timeout_secs: u64,
  pub connect_timeout_secs: u64,
  /// Messages held while disconnected before `overflow` applies
  pub max_pending: usize,
  pub overflow: OverflowPolicy,
  pub auto_reconnect: bool,
}

impl Default for TransportConfig {
  fn default() -> Self {
    Self {
      initial_backoff_ms: 1_000,
      max_backoff_ms: 30_000,
      backoff_multiplier: 2,
      heartbeat_interval_secs: 30,
      heartbeat_timeout_secs: 10,
      connect_timeout_secs: 10,
      max_pending: 1_000,
      overflow: OverflowPolicy::DropOldest,
      auto_reconnect: true,
    }
  }
}

impl TransportConfig {
  pub fn initial_backoff(&self) -> Duration {
    Duration::from_millis(self.initial_backoff_ms)
  }

  pub fn max_backoff(&self) -> Duration {
    Duration::from_millis(self.max_backoff_ms)
  }

  pub fn heartbeat_interval(&self) -> Duration {
    Duration::from_secs(self.heartbeat_interval_secs)
  }

  pub fn heartbeat_timeout(&self) -> Duration {
    Duration::from_secs(self.heartbeat_timeout_secs)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed dispatches after which an action is reported as exhausted
  pub max_retries: u32,
  /// Replay automatically on the offline -> online edge
  pub replay_on_reconnect: bool,
  /// Poll `<base_url>/health` at this interval to detect connectivity (0 = off)
  pub health_probe_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      replay_on_reconnect: true,
      health_probe_secs: 0,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub budget_bytes: u64,
  /// Age after which a cached resource is refetched when online
  pub stale_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      budget_bytes: 50 * 1024 * 1024,
      stale_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/campus-relay/offline.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./campus-relay.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/campus-relay/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/campus-relay/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("campus-relay.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("campus-relay").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.transport.max_pending == 0 {
      return Err(eyre!("transport.max_pending must be at least 1"));
    }
    if config.transport.heartbeat_interval_secs == 0 {
      return Err(eyre!("transport.heartbeat_interval_secs must be at least 1"));
    }
    if config.transport.connect_timeout_secs == 0 {
      return Err(eyre!("transport.connect_timeout_secs must be at least 1"));
    }
    if config.transport.backoff_multiplier == 0 {
      return Err(eyre!("transport.backoff_multiplier must be at least 1"));
    }
    Ok(config)
  }

  /// Bearer token for the API and socket handshake, if one is set.
  ///
  /// Reads CAMPUS_RELAY_TOKEN.
  pub fn get_token() -> Option<String> {
    std::env::var("CAMPUS_RELAY_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
