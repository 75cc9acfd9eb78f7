//! Directory of live connections keyed by (channel, identity).

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;
use url::Url;

use super::connection::{
  ConnectionHandle, ConnectionKey, ConnectionSettings, ConnectionStatus, MessageHandler,
  StatusChange,
};
use super::socket::Connector;

const STATUS_EVENT_CAPACITY: usize = 256;

/// Owns one connection per (channel, identity) and fans out their status changes.
pub struct ConnectionRegistry {
  ws_root: String,
  /// Channel name -> path template containing `{identity}`
  channels: BTreeMap<String, String>,
  settings: ConnectionSettings,
  connector: Arc<dyn Connector>,
  connections: Mutex<HashMap<ConnectionKey, ConnectionHandle>>,
  events: broadcast::Sender<StatusChange>,
}

impl ConnectionRegistry {
  pub fn new(
    ws_root: impl Into<String>,
    channels: BTreeMap<String, String>,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
  ) -> Self {
    let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
    Self {
      ws_root: ws_root.into(),
      channels,
      settings,
      connector,
      connections: Mutex::new(HashMap::new()),
      events,
    }
  }

  /// Endpoint URL for a channel and identity.
  pub fn endpoint(&self, channel: &str, identity: &str) -> Result<String> {
    let template = self
      .channels
      .get(channel)
      .ok_or_else(|| eyre!("Unknown channel: {}", channel))?;

    let encoded: String = url::form_urlencoded::byte_serialize(identity.as_bytes()).collect();
    let path = template.replace("{identity}", &encoded);
    let url = format!("{}{}", self.ws_root, path);

    Url::parse(&url).map_err(|e| eyre!("Invalid endpoint {} for channel {}: {}", url, channel, e))?;
    Ok(url)
  }

  /// Get the connection for (channel, identity), opening it on first use.
  ///
  /// Repeated calls return the same connection; `handler` is only used when
  /// the connection is created.
  pub fn get_connection(
    &self,
    channel: &str,
    identity: &str,
    handler: MessageHandler,
  ) -> Result<ConnectionHandle> {
    let key = ConnectionKey::new(channel, identity);
    let mut connections = self
      .connections
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(existing) = connections.get(&key) {
      if !existing.is_closed() {
        return Ok(existing.clone());
      }
    }

    let url = self.endpoint(channel, identity)?;
    info!(connection = %key, %url, "opening connection");
    let handle = ConnectionHandle::spawn(
      key.clone(),
      url,
      self.settings.clone(),
      Arc::clone(&self.connector),
      handler,
      self.events.clone(),
    );
    connections.insert(key, handle.clone());
    Ok(handle)
  }

  /// Observe status changes of every connection in the registry.
  pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
    self.events.subscribe()
  }

  /// Current status of every connection, ordered by key.
  pub fn statuses(&self) -> Vec<(ConnectionKey, ConnectionStatus)> {
    let mut statuses: Vec<_> = match self.connections.lock() {
      Ok(c) => c.iter().map(|(k, h)| (k.clone(), h.status())).collect(),
      Err(_) => Vec::new(),
    };
    statuses.sort_by(|a, b| a.0.cmp(&b.0));
    statuses
  }

  /// Skip the backoff delay of every connection that is waiting to reconnect.
  pub fn reconnect_now(&self) {
    let Ok(connections) = self.connections.lock() else {
      return;
    };
    for handle in connections.values() {
      if matches!(
        handle.status(),
        ConnectionStatus::Reconnecting | ConnectionStatus::Disconnected
      ) {
        let _ = handle.connect();
      }
    }
  }

  /// Close and forget one connection. Returns false if it was not registered.
  pub async fn disconnect(&self, key: &ConnectionKey) -> bool {
    let handle = match self.connections.lock() {
      Ok(mut c) => c.remove(key),
      Err(_) => None,
    };
    match handle {
      Some(handle) => {
        handle.disconnect().await;
        true
      }
      None => false,
    }
  }

  /// Close every connection (logout / shutdown).
  pub async fn disconnect_all(&self) {
    let handles: Vec<ConnectionHandle> = match self.connections.lock() {
      Ok(mut c) => c.drain().map(|(_, h)| h).collect(),
      Err(_) => Vec::new(),
    };
    info!(count = handles.len(), "closing all connections");
    futures::future::join_all(handles.iter().map(|h| h.disconnect())).await;
  }
}
