//! Application-facing context that owns the transport, queue, cache and monitor.

use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheReceipt, CacheResult, CacheStats, CachedResource, ResourceCache};
use crate::config::Config;
use crate::db::Database;
use crate::network::{NetworkMonitor, NetworkState};
use crate::queue::{
  ActionDispatcher, ActionKind, ActionQueue, HttpDispatcher, Operation, QueuedAction, Replayer,
  SyncOutcome,
};
use crate::transport::{
  ConnectionHandle, ConnectionKey, ConnectionRegistry, ConnectionSettings, ConnectionStatus,
  Connector, MessageHandler, StatusChange, WsConnector,
};

/// Created by [`OfflineManager::init`], consumed by [`OfflineManager::shutdown`].
pub struct OfflineManager {
  config: Config,
  queue: ActionQueue,
  replayer: Replayer,
  cache: CacheLayer,
  registry: Arc<ConnectionRegistry>,
  network: NetworkMonitor,
  tasks: Vec<JoinHandle<()>>,
}

impl OfflineManager {
  /// Open the database and wire the WebSocket and HTTP backends from `config`.
  ///
  /// Must be called inside a tokio runtime.
  pub fn init(config: Config) -> Result<Self> {
    let db = Database::open(config.storage.path.as_deref())?;
    let token = Config::get_token();

    let client = Client::builder()
      .user_agent(concat!("campus-relay/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    let connector = Arc::new(WsConnector::new(token.clone()));
    let dispatcher = Arc::new(HttpDispatcher::new(
      client.clone(),
      &config.server.base_url,
      token,
    )?);

    let mut manager = Self::with_backends(config, db, connector, dispatcher);

    if manager.config.queue.health_probe_secs > 0 {
      let url = format!("{}/health", manager.config.server.base_url.trim_end_matches('/'));
      let every = Duration::from_secs(manager.config.queue.health_probe_secs);
      let probe = manager.network.spawn_health_probe(client, url, every);
      manager.tasks.push(probe);
    }

    info!(base_url = %manager.config.server.base_url, "offline manager ready");
    Ok(manager)
  }

  /// Assemble the manager over explicit backends.
  pub fn with_backends(
    config: Config,
    db: Database,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<dyn ActionDispatcher>,
  ) -> Self {
    let queue = ActionQueue::new(db.clone(), config.queue.max_retries);
    let replayer = Replayer::new(queue.clone(), dispatcher);
    let cache = CacheLayer::new(ResourceCache::new(db, config.cache.budget_bytes))
      .with_stale_time(chrono::Duration::seconds(config.cache.stale_secs as i64));
    let registry = Arc::new(ConnectionRegistry::new(
      config.server.ws_root(),
      config.channels.clone(),
      ConnectionSettings::from(&config.transport),
      connector,
    ));
    let network = NetworkMonitor::new(NetworkState::Online);

    let replay = config.queue.replay_on_reconnect;
    let on_reconnect = {
      let replayer = replayer.clone();
      let registry = Arc::clone(&registry);
      network.on_reconnect(move || {
        let replayer = replayer.clone();
        let registry = Arc::clone(&registry);
        async move {
          registry.reconnect_now();
          if !replay {
            return;
          }
          match replayer.sync().await {
            Ok(SyncOutcome::Completed(summary)) if !summary.exhausted.is_empty() => {
              warn!(exhausted = ?summary.exhausted, "actions out of retries");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "replay on reconnect failed"),
          }
        }
      })
    };

    Self {
      config,
      queue,
      replayer,
      cache,
      registry,
      network,
      tasks: vec![on_reconnect],
    }
  }

  // Transport

  /// Open (or reuse) the connection for a channel and identity.
  pub fn connect(
    &self,
    channel: &str,
    identity: &str,
    on_message: MessageHandler,
  ) -> Result<ConnectionHandle> {
    self.registry.get_connection(channel, identity, on_message)
  }

  pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
    self.registry.subscribe()
  }

  pub fn connection_statuses(&self) -> Vec<(ConnectionKey, ConnectionStatus)> {
    self.registry.statuses()
  }

  pub async fn disconnect(&self, channel: &str, identity: &str) -> bool {
    self
      .registry
      .disconnect(&ConnectionKey::new(channel, identity))
      .await
  }

  // Offline queue

  /// Durably record a user action for replay.
  pub fn add_to_queue(
    &self,
    kind: ActionKind,
    operation: Operation,
    payload: Value,
  ) -> Result<QueuedAction> {
    self.queue.enqueue(kind, operation, payload)
  }

  pub async fn sync_offline_queue(&self) -> Result<SyncOutcome> {
    self.replayer.sync().await
  }

  /// Direct access for listing, resetting or discarding queued actions.
  pub fn queue(&self) -> &ActionQueue {
    &self.queue
  }

  // Cache

  /// Fails with a [`crate::error::CacheOverflow`] report if the resource exceeds the budget.
  pub fn cache_resource(&self, resource: &CachedResource) -> Result<CacheReceipt> {
    self.cache.cache().put(resource)
  }

  pub fn get_cached_resource(&self, id: &str) -> Result<Option<CachedResource>> {
    self.cache.cache().get(id)
  }

  pub fn remove_cached_resource(&self, id: &str) -> Result<bool> {
    self.cache.cache().remove(id)
  }

  pub fn clear_cache(&self) -> Result<()> {
    self.cache.cache().clear_all()
  }

  /// Expire entries older than `max_age`. Returns the expired ids.
  pub fn cleanup_cache(&self, max_age: chrono::Duration) -> Result<Vec<String>> {
    self.cache.cache().cleanup(max_age)
  }

  pub fn get_cache_stats(&self) -> Result<CacheStats> {
    self.cache.cache().stats()
  }

  /// Cache-first read through `fetcher`.
  pub async fn fetch_resource<F, Fut>(
    &self,
    id: &str,
    fetcher: F,
  ) -> Result<CacheResult<CachedResource>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
  {
    self.cache.fetch(id, fetcher).await
  }

  // Network

  pub fn set_network_state(&self, state: NetworkState) {
    self.network.set_state(state);
  }

  pub fn network(&self) -> &NetworkMonitor {
    &self.network
  }

  /// Close every connection and stop background tasks.
  pub async fn shutdown(self) {
    self.registry.disconnect_all().await;
    for task in &self.tasks {
      task.abort();
    }
    info!("offline manager shut down");
  }
}
