//! One logical connection: connect / heartbeat / reconnect state machine.
//!
//! Each connection runs as a single tokio task that exclusively owns the
//! socket, the timers and the pending-outbound queue. [`ConnectionHandle`]s talk
//! to it over a command channel, so all state changes happen in one place and
//! every timer is a future in the task's `select!` that is dropped (cancelled)
//! as soon as the phase it belongs to ends.
//!
//! ```text
//!              connect()                 socket open
//! Disconnected ─────────▶ Connecting ───────────────▶ Connected
//!      ▲  ▲                  ▲   │ error                  │ close / error /
//!      │  │ auto_reconnect   │   ▼                        │ missed pong
//!      │  └── off ──── Disconnected ◀─────────────────────┘
//!      │                     │ auto_reconnect on
//!      │                     ▼
//!      │              Reconnecting ── delay elapsed / connect() ──▶ Connecting
//!      └── disconnect() from any state (terminal)
//! ```

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::envelope::Envelope;
use super::socket::{Connector, FrameSink, Socket};
use crate::config::{OverflowPolicy, TransportConfig};
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionKey {
  pub channel: String,
  pub identity: String,
}

impl ConnectionKey {
  pub fn new(channel: impl Into<String>, identity: impl Into<String>) -> Self {
    Self {
      channel: channel.into(),
      identity: identity.into(),
    }
  }
}

impl fmt::Display for ConnectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.channel, self.identity)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  Connecting,
  Connected,
  Disconnected,
  Reconnecting,
}

/// A status transition, fanned out to every registry observer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
  pub key: ConnectionKey,
  pub from: ConnectionStatus,
  pub to: ConnectionStatus,
  pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
  /// Written to the open socket
  Delivered,
  /// Held until the next successful connect
  Queued,
}

/// Receives every non-heartbeat message pushed by the server.
pub type MessageHandler = Arc<dyn Fn(&ConnectionKey, Envelope) + Send + Sync>;

/// Tunables for one connection, taken from [`TransportConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub backoff_multiplier: u32,
  pub heartbeat_interval: Duration,
  pub heartbeat_timeout: Duration,
  /// Abandon a connect attempt that has not opened by then
  pub connect_timeout: Duration,
  pub max_pending: usize,
  pub overflow: OverflowPolicy,
  pub auto_reconnect: bool,
}

impl From<&TransportConfig> for ConnectionSettings {
  fn from(config: &TransportConfig) -> Self {
    Self {
      initial_backoff: config.initial_backoff(),
      max_backoff: config.max_backoff(),
      backoff_multiplier: config.backoff_multiplier,
      heartbeat_interval: config.heartbeat_interval(),
      heartbeat_timeout: config.heartbeat_timeout(),
      connect_timeout: config.connect_timeout(),
      max_pending: config.max_pending.max(1),
      overflow: config.overflow,
      auto_reconnect: config.auto_reconnect,
    }
  }
}

impl Default for ConnectionSettings {
  fn default() -> Self {
    Self::from(&TransportConfig::default())
  }
}

enum Command {
  Connect,
  Send {
    message: Envelope,
    reply: oneshot::Sender<Result<SendOutcome, TransportError>>,
  },
  Disconnect {
    reply: oneshot::Sender<()>,
  },
}

/// Cloneable handle to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
  key: ConnectionKey,
  commands: mpsc::UnboundedSender<Command>,
  status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
  /// Spawn the connection task; it starts connecting immediately.
  pub fn spawn(
    key: ConnectionKey,
    url: String,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    handler: MessageHandler,
    events: broadcast::Sender<StatusChange>,
  ) -> Self {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

    let backoff = Backoff::new(
      settings.initial_backoff,
      settings.max_backoff,
      settings.backoff_multiplier,
    );
    let actor = ConnectionActor {
      key: key.clone(),
      url,
      settings,
      connector,
      handler,
      events,
      status: status_tx,
      commands: commands_rx,
      backoff,
      pending: VecDeque::new(),
      last_pong: None,
    };
    tokio::spawn(actor.run());

    Self {
      key,
      commands: commands_tx,
      status: status_rx,
    }
  }

  pub fn key(&self) -> &ConnectionKey {
    &self.key
  }

  pub fn status(&self) -> ConnectionStatus {
    *self.status.borrow()
  }

  /// Watch this connection's status.
  pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
    self.status.clone()
  }

  /// Whether the connection task has ended (manual disconnect).
  pub fn is_closed(&self) -> bool {
    self.commands.is_closed()
  }

  /// Send a message, or queue it until the socket is back.
  pub async fn send(&self, message: Envelope) -> Result<SendOutcome, TransportError> {
    let (reply, rx) = oneshot::channel();
    self
      .commands
      .send(Command::Send { message, reply })
      .map_err(|_| TransportError::Closed)?;
    rx.await.map_err(|_| TransportError::Closed)?
  }

  /// Connect now if disconnected, skipping any pending reconnect delay.
  pub fn connect(&self) -> Result<(), TransportError> {
    self
      .commands
      .send(Command::Connect)
      .map_err(|_| TransportError::Closed)
  }

  /// Close the connection for good. Resolves once the task has stopped.
  pub async fn disconnect(&self) {
    let (reply, rx) = oneshot::channel();
    if self.commands.send(Command::Disconnect { reply }).is_ok() {
      let _ = rx.await;
    }
  }
}

impl fmt::Debug for ConnectionHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionHandle")
      .field("key", &self.key)
      .field("status", &self.status())
      .finish()
  }
}

/// What the task does next.
enum Phase {
  Connecting,
  Reconnecting,
  /// Disconnected without auto-reconnect; waits for `connect()`
  Idle,
  Closed,
}

struct ConnectionActor {
  key: ConnectionKey,
  url: String,
  settings: ConnectionSettings,
  connector: Arc<dyn Connector>,
  handler: MessageHandler,
  events: broadcast::Sender<StatusChange>,
  status: watch::Sender<ConnectionStatus>,
  commands: mpsc::UnboundedReceiver<Command>,
  backoff: Backoff,
  pending: VecDeque<Envelope>,
  last_pong: Option<DateTime<Utc>>,
}

impl ConnectionActor {
  async fn run(mut self) {
    let mut phase = Phase::Connecting;
    loop {
      phase = match phase {
        Phase::Connecting => self.connecting().await,
        Phase::Reconnecting => self.reconnecting().await,
        Phase::Idle => self.idle().await,
        Phase::Closed => break,
      };
    }

    self.set_status(ConnectionStatus::Disconnected);
    if !self.pending.is_empty() {
      warn!(
        connection = %self.key,
        dropped = self.pending.len(),
        "connection closed with unsent messages"
      );
    }
    info!(connection = %self.key, "connection closed");
  }

  fn set_status(&mut self, to: ConnectionStatus) {
    let from = *self.status.borrow();
    if from == to {
      return;
    }
    self.status.send_replace(to);
    debug!(connection = %self.key, ?from, ?to, "status changed");
    // No observers is fine
    let _ = self.events.send(StatusChange {
      key: self.key.clone(),
      from,
      to,
      at: Utc::now(),
    });
  }

  /// Hold a message for the next connect, applying the overflow policy.
  fn enqueue(&mut self, message: Envelope) -> Result<SendOutcome, TransportError> {
    if self.pending.len() >= self.settings.max_pending {
      match self.settings.overflow {
        OverflowPolicy::DropOldest => {
          if let Some(dropped) = self.pending.pop_front() {
            warn!(
              connection = %self.key,
              kind = dropped.kind(),
              "pending queue full, dropping oldest message"
            );
          }
        }
        OverflowPolicy::Reject => {
          return Err(TransportError::QueueFull {
            capacity: self.settings.max_pending,
          });
        }
      }
    }
    self.pending.push_back(message);
    Ok(SendOutcome::Queued)
  }

  /// Commands that behave the same in every phase without a socket.
  /// Returns `Some(phase)` when the command ends the current phase.
  fn handle_offline_command(&mut self, command: Option<Command>) -> Option<Phase> {
    match command {
      None => Some(Phase::Closed),
      Some(Command::Disconnect { reply }) => {
        let _ = reply.send(());
        Some(Phase::Closed)
      }
      Some(Command::Send { message, reply }) => {
        let _ = reply.send(self.enqueue(message));
        None
      }
      Some(Command::Connect) => None,
    }
  }

  /// Unexpected loss of the socket (or a failed attempt).
  fn dropped(&mut self, error: &TransportError) -> Phase {
    warn!(connection = %self.key, %error, "connection lost");
    self.set_status(ConnectionStatus::Disconnected);
    if self.settings.auto_reconnect {
      Phase::Reconnecting
    } else {
      Phase::Idle
    }
  }

  async fn connecting(&mut self) -> Phase {
    self.set_status(ConnectionStatus::Connecting);
    debug!(connection = %self.key, url = %self.url, "connecting");

    let limit = self.settings.connect_timeout;
    let attempt = timeout(limit, self.connector.connect(&self.url));
    tokio::pin!(attempt);

    loop {
      tokio::select! {
        result = &mut attempt => {
          return match result {
            Ok(Ok(socket)) => self.connected(socket).await,
            Ok(Err(e)) => self.dropped(&e),
            Err(_) => self.dropped(&TransportError::ConnectTimeout(limit)),
          };
        }
        command = self.commands.recv() => {
          if let Some(phase) = self.handle_offline_command(command) {
            return phase;
          }
        }
      }
    }
  }

  async fn reconnecting(&mut self) -> Phase {
    let delay = self.backoff.next_delay();
    self.set_status(ConnectionStatus::Reconnecting);
    info!(
      connection = %self.key,
      attempt = self.backoff.attempts(),
      delay_ms = delay.as_millis() as u64,
      "scheduling reconnect"
    );

    let timer = sleep(delay);
    tokio::pin!(timer);

    loop {
      tokio::select! {
        _ = &mut timer => return Phase::Connecting,
        command = self.commands.recv() => match command {
          Some(Command::Connect) => return Phase::Connecting,
          other => {
            if let Some(phase) = self.handle_offline_command(other) {
              return phase;
            }
          }
        }
      }
    }
  }

  async fn idle(&mut self) -> Phase {
    self.set_status(ConnectionStatus::Disconnected);
    loop {
      match self.commands.recv().await {
        Some(Command::Connect) => return Phase::Connecting,
        other => {
          if let Some(phase) = self.handle_offline_command(other) {
            return phase;
          }
        }
      }
    }
  }

  async fn connected(&mut self, socket: Socket) -> Phase {
    let Socket {
      mut sink,
      mut stream,
    } = socket;

    self.backoff.reset();
    self.set_status(ConnectionStatus::Connected);
    info!(connection = %self.key, "connected");

    // Drain what was queued while offline before taking any new command.
    while let Some(message) = self.pending.pop_front() {
      if let Err(e) = write(&mut sink, &message).await {
        self.pending.push_front(message);
        return self.dropped(&e);
      }
    }

    let interval = self.settings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
      let deadline = pong_deadline;
      let pong_timeout = async move {
        match deadline {
          Some(at) => sleep_until(at).await,
          None => std::future::pending().await,
        }
      };

      tokio::select! {
        frame = stream.next() => match frame {
          Some(Ok(text)) => {
            if let Err(e) = self.on_frame(&text, &mut sink, &mut pong_deadline).await {
              return self.dropped(&e);
            }
          }
          Some(Err(e)) => return self.dropped(&e),
          None => return self.dropped(&TransportError::ClosedByPeer),
        },

        _ = heartbeat.tick() => {
          if let Err(e) = write(&mut sink, &Envelope::Ping).await {
            return self.dropped(&e);
          }
          if pong_deadline.is_none() {
            pong_deadline = Some(Instant::now() + self.settings.heartbeat_timeout);
          }
        }

        _ = pong_timeout => {
          warn!(connection = %self.key, last_pong = ?self.last_pong, "heartbeat timed out");
          let _ = sink.close().await;
          return self.dropped(&TransportError::HeartbeatTimeout(self.settings.heartbeat_timeout));
        }

        command = self.commands.recv() => match command {
          Some(Command::Send { message, reply }) => {
            match write(&mut sink, &message).await {
              Ok(()) => {
                let _ = reply.send(Ok(SendOutcome::Delivered));
              }
              Err(TransportError::Encode(e)) => {
                let _ = reply.send(Err(TransportError::Encode(e)));
              }
              Err(e) => {
                let _ = reply.send(self.enqueue(message));
                return self.dropped(&e);
              }
            }
          }
          Some(Command::Connect) => {}
          Some(Command::Disconnect { reply }) => {
            let _ = sink.close().await;
            let _ = reply.send(());
            return Phase::Closed;
          }
          None => {
            let _ = sink.close().await;
            return Phase::Closed;
          }
        }
      }
    }
  }

  async fn on_frame(
    &mut self,
    text: &str,
    sink: &mut FrameSink,
    pong_deadline: &mut Option<Instant>,
  ) -> Result<(), TransportError> {
    let envelope = match Envelope::decode(text) {
      Ok(envelope) => envelope,
      Err(e) => {
        warn!(connection = %self.key, error = %e, "dropping malformed message");
        return Ok(());
      }
    };

    match envelope {
      Envelope::Pong => {
        *pong_deadline = None;
        self.last_pong = Some(Utc::now());
        debug!(connection = %self.key, "pong");
      }
      Envelope::Ping => write(sink, &Envelope::Pong).await?,
      message => (self.handler)(&self.key, message),
    }
    Ok(())
  }
}

async fn write(sink: &mut FrameSink, message: &Envelope) -> Result<(), TransportError> {
  let text = message
    .encode()
    .map_err(|e| TransportError::Encode(e.to_string()))?;
  sink.send(text).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::socket::testing::{FakeConnector, FakePeer, Script};
  use serde_json::json;
  use std::sync::Mutex;

  fn settings() -> ConnectionSettings {
    ConnectionSettings {
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(30),
      backoff_multiplier: 2,
      heartbeat_interval: Duration::from_secs(30),
      heartbeat_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(10),
      max_pending: 100,
      overflow: OverflowPolicy::DropOldest,
      auto_reconnect: true,
    }
  }

  struct Harness {
    handle: ConnectionHandle,
    connector: FakeConnector,
    events: broadcast::Receiver<StatusChange>,
    delivered: Arc<Mutex<Vec<Envelope>>>,
  }

  fn spawn(script: Vec<Script>, settings: ConnectionSettings) -> Harness {
    let connector = FakeConnector::new(script);
    let (events_tx, events) = broadcast::channel(256);
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let handler: MessageHandler = Arc::new(move |_key: &ConnectionKey, message: Envelope| {
      sink.lock().unwrap().push(message);
    });
    let handle = ConnectionHandle::spawn(
      ConnectionKey::new("teacher", "t1"),
      "ws://test/ws/teacher/t1".into(),
      settings,
      Arc::new(connector.clone()),
      handler,
      events_tx,
    );
    Harness {
      handle,
      connector,
      events,
      delivered,
    }
  }

  async fn wait_for(handle: &ConnectionHandle, status: ConnectionStatus) {
    let mut rx = handle.watch_status();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| *s == status))
      .await
      .expect("status not reached")
      .expect("connection task gone");
  }

  async fn accepted_peer(h: &Harness) -> FakePeer {
    wait_for(&h.handle, ConnectionStatus::Connected).await;
    h.connector.take_peer().expect("peer")
  }

  fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_connects_back_off_exponentially() {
    let h = spawn(vec![Script::Fail; 5], settings());
    h.connector.push_script(Script::Accept);

    wait_for(&h.handle, ConnectionStatus::Connected).await;

    let times = h.connector.attempt_times();
    assert_eq!(times.len(), 6);
    let secs: Vec<u64> = gaps(&times).iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 16]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_backoff_caps_at_max() {
    let h = spawn(vec![Script::Fail; 8], settings());
    h.connector.push_script(Script::Accept);

    wait_for(&h.handle, ConnectionStatus::Connected).await;

    let secs: Vec<u64> = gaps(&h.connector.attempt_times())
      .iter()
      .map(|d| d.as_secs())
      .collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_delay_resets_after_successful_connect() {
    let h = spawn(
      vec![Script::Fail, Script::Fail, Script::Accept, Script::Fail, Script::Accept],
      settings(),
    );

    let peer = accepted_peer(&h).await;
    // Peer goes away: the next first delay must be the initial one again
    drop(peer);
    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    wait_for(&h.handle, ConnectionStatus::Connected).await;

    let secs: Vec<u64> = gaps(&h.connector.attempt_times())
      .iter()
      .map(|d| d.as_secs())
      .collect();
    // fail, fail(1s), accept(2s) | drop -> fail(1s), accept(2s)
    assert_eq!(secs, vec![1, 2, 1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_sends_while_disconnected_flush_in_order() {
    let h = spawn(vec![Script::Fail, Script::Accept], settings());

    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    for i in 0..5 {
      let outcome = h
        .handle
        .send(Envelope::custom("note", json!({ "n": i })))
        .await
        .unwrap();
      assert_eq!(outcome, SendOutcome::Queued);
    }

    let mut peer = accepted_peer(&h).await;
    let outcome = h
      .handle
      .send(Envelope::custom("note", json!({ "n": 5 })))
      .await
      .unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    let order: Vec<i64> = peer
      .drain()
      .iter()
      .map(|f| serde_json::from_str::<serde_json::Value>(f).unwrap()["n"].as_i64().unwrap())
      .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pending_overflow_drops_oldest() {
    let mut s = settings();
    s.max_pending = 2;
    let h = spawn(vec![Script::Fail, Script::Accept], s);

    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    for i in 0..3 {
      h.handle
        .send(Envelope::custom("note", json!({ "n": i })))
        .await
        .unwrap();
    }

    let mut peer = accepted_peer(&h).await;
    // Wait until flushed, then make sure nothing else arrives
    h.handle.send(Envelope::custom("marker", json!({}))).await.unwrap();
    let frames = peer.drain();
    assert_eq!(frames.len(), 3);
    assert!(frames[0].contains("\"n\":1"));
    assert!(frames[1].contains("\"n\":2"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_pending_overflow_reject() {
    let mut s = settings();
    s.max_pending = 1;
    s.overflow = OverflowPolicy::Reject;
    let h = spawn(vec![], s);

    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    assert_eq!(
      h.handle.send(Envelope::custom("a", json!({}))).await,
      Ok(SendOutcome::Queued)
    );
    assert_eq!(
      h.handle.send(Envelope::custom("b", json!({}))).await,
      Err(TransportError::QueueFull { capacity: 1 })
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_missed_pong_forces_reconnect() {
    let mut h = spawn(vec![Script::Accept, Script::Accept], settings());
    let mut peer = accepted_peer(&h).await;
    let connected_at = Instant::now();

    // Ping after the heartbeat interval
    let frame = peer.next_frame().await.unwrap();
    assert_eq!(frame, r#"{"type":"ping"}"#);
    assert_eq!(Instant::now() - connected_at, Duration::from_secs(30));

    // No pong: the socket is forced closed and the reconnect path starts
    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    assert_eq!(Instant::now() - connected_at, Duration::from_secs(40));
    assert!(peer.next_frame().await.is_none(), "client side should be closed");

    let mut seen = Vec::new();
    while let Ok(change) = h.events.try_recv() {
      seen.push(change.to);
    }
    assert!(seen.ends_with(&[
      ConnectionStatus::Connected,
      ConnectionStatus::Disconnected,
      ConnectionStatus::Reconnecting
    ]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_pong_keeps_connection_alive() {
    let h = spawn(vec![Script::Accept], settings());
    let mut peer = accepted_peer(&h).await;

    for _ in 0..3 {
      let frame = peer.next_frame().await.unwrap();
      assert_eq!(frame, r#"{"type":"ping"}"#);
      peer.push(r#"{"type":"pong"}"#);
    }

    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
    assert_eq!(h.connector.attempt_times().len(), 1);
    assert!(h.delivered.lock().unwrap().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_push_messages_reach_handler_and_heartbeats_do_not() {
    let h = spawn(vec![Script::Accept], settings());
    let mut peer = accepted_peer(&h).await;

    peer.push(r#"{"type":"attendance_update","student_id":"s1"}"#);
    peer.push("{broken");
    peer.push(r#"{"type":"ping"}"#);
    peer.push(r#"{"type":"document_shared","document_id":"d1"}"#);

    // Server ping is answered with a pong
    assert_eq!(peer.next_frame().await.unwrap(), r#"{"type":"pong"}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let delivered = h.delivered.lock().unwrap().clone();
    let kinds: Vec<&str> = delivered.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["attendance_update", "document_shared"]);
    assert_eq!(h.handle.status(), ConnectionStatus::Connected);
  }

  #[tokio::test(start_paused = true)]
  async fn test_manual_disconnect_is_terminal() {
    let h = spawn(vec![Script::Accept, Script::Accept], settings());
    let mut peer = accepted_peer(&h).await;

    h.handle.disconnect().await;

    assert!(peer.next_frame().await.is_none());
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempt_times().len(), 1);
    assert!(h.handle.is_closed());
    assert_eq!(
      h.handle.send(Envelope::custom("late", json!({}))).await,
      Err(TransportError::Closed)
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_disconnect_cancels_pending_reconnect() {
    let h = spawn(vec![], settings());
    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;

    h.handle.disconnect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.connector.attempt_times().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_connect_times_out_into_reconnect() {
    let h = spawn(vec![Script::Hang, Script::Accept], settings());

    wait_for(&h.handle, ConnectionStatus::Connected).await;

    // 10s connect timeout, then the first 1s backoff
    let secs: Vec<u64> = gaps(&h.connector.attempt_times())
      .iter()
      .map(|d| d.as_secs())
      .collect();
    assert_eq!(secs, vec![11]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_connect_skips_reconnect_delay() {
    let h = spawn(vec![Script::Fail, Script::Fail, Script::Accept], settings());
    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    // Second attempt failed at t=1s; now waiting 2s. Connect right away instead.
    wait_for(&h.handle, ConnectionStatus::Reconnecting).await;
    let before = Instant::now();
    h.handle.connect().unwrap();
    wait_for(&h.handle, ConnectionStatus::Connected).await;

    assert_eq!(Instant::now(), before);
    assert_eq!(h.connector.attempt_times().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_without_auto_reconnect_stays_disconnected() {
    let mut s = settings();
    s.auto_reconnect = false;
    let h = spawn(vec![Script::Fail, Script::Accept], s);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempt_times().len(), 1);
    assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);

    h.handle.connect().unwrap();
    wait_for(&h.handle, ConnectionStatus::Connected).await;
    assert_eq!(h.connector.attempt_times().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_write_failure_requeues_message() {
    let h = spawn(vec![Script::Accept, Script::Accept], settings());
    let peer = accepted_peer(&h).await;

    // Peer stops reading: client writes fail
    let FakePeer { received, outgoing } = peer;
    drop(received);

    let outcome = h
      .handle
      .send(Envelope::custom("note", json!({ "n": 1 })))
      .await
      .unwrap();
    assert_eq!(outcome, SendOutcome::Queued);
    drop(outgoing);

    let mut peer = accepted_peer(&h).await;
    let frame = peer.next_frame().await.unwrap();
    assert!(frame.contains("\"n\":1"));
  }
}
