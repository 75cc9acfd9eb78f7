use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use campus_relay::transport::{ConnectionKey, Envelope, MessageHandler, StatusChange};

/// Events driving the `listen` loop
#[derive(Debug)]
pub enum Event {
  /// Message pushed by the server
  Push { key: ConnectionKey, message: Envelope },
  /// A connection changed state
  Status(StatusChange),
  /// Periodic tick for status reporting
  Tick,
  /// Ctrl-C
  Shutdown,
}

/// Merges server pushes, status changes, a tick timer and Ctrl-C into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(tick_rate: Duration, mut status: broadcast::Receiver<StatusChange>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let ticks = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.tick().await;
      loop {
        interval.tick().await;
        if ticks.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    let changes = tx.clone();
    tokio::spawn(async move {
      loop {
        match status.recv().await {
          Ok(change) => {
            if changes.send(Event::Status(change)).is_err() {
              break;
            }
          }
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "status events lagged");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    });

    let shutdown = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = shutdown.send(Event::Shutdown);
      }
    });

    Self { tx, rx }
  }

  /// Handler that forwards pushed messages into this stream
  pub fn message_handler(&self) -> MessageHandler {
    let tx = self.tx.clone();
    Arc::new(move |key: &ConnectionKey, message: Envelope| {
      let _ = tx.send(Event::Push {
        key: key.clone(),
        message,
      });
    })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
