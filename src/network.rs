//! Connectivity state and the offline -> online edge.

use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
  Online,
  Offline,
}

/// Tracks whether the server is reachable. Fed by the platform or a health probe.
#[derive(Clone)]
pub struct NetworkMonitor {
  state: Arc<watch::Sender<NetworkState>>,
  /// One message per offline -> online transition
  reconnects: broadcast::Sender<()>,
}

impl NetworkMonitor {
  pub fn new(initial: NetworkState) -> Self {
    let (tx, _) = watch::channel(initial);
    let (reconnects, _) = broadcast::channel(16);
    Self {
      state: Arc::new(tx),
      reconnects,
    }
  }

  pub fn state(&self) -> NetworkState {
    *self.state.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.state() == NetworkState::Online
  }

  /// Update the state. Returns true if it changed.
  pub fn set_state(&self, state: NetworkState) -> bool {
    let mut previous = state;
    let changed = self.state.send_if_modified(|current| {
      previous = *current;
      if *current == state {
        false
      } else {
        *current = state;
        true
      }
    });
    if changed {
      info!(?state, "network state changed");
      if previous == NetworkState::Offline && state == NetworkState::Online {
        let _ = self.reconnects.send(());
      }
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
    self.state.subscribe()
  }

  /// Run `f` on every offline -> online transition until the monitor is dropped.
  pub fn on_reconnect<F, Fut>(&self, mut f: F) -> JoinHandle<()>
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let mut edges = self.reconnects.subscribe();
    tokio::spawn(async move {
      loop {
        match edges.recv().await {
          Ok(()) | Err(RecvError::Lagged(_)) => {
            debug!("network came back");
            f().await;
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  /// Poll `url` every `every`; a 2xx response means online.
  pub fn spawn_health_probe(&self, client: Client, url: String, every: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = match client.get(&url).timeout(every).send().await {
          Ok(response) => response.status().is_success(),
          Err(e) => {
            debug!(%url, error = %e, "health probe failed");
            false
          }
        };
        monitor.set_state(if online {
          NetworkState::Online
        } else {
          NetworkState::Offline
        });
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  #[test]
  fn test_set_state_reports_changes() {
    let monitor = NetworkMonitor::new(NetworkState::Online);
    assert!(!monitor.set_state(NetworkState::Online));
    assert!(monitor.set_state(NetworkState::Offline));
    assert!(!monitor.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_on_reconnect_fires_per_edge() {
    let monitor = NetworkMonitor::new(NetworkState::Online);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = monitor.on_reconnect(move || {
      let tx = tx.clone();
      async move {
        let _ = tx.send(());
      }
    });

    let step = Duration::from_millis(1);
    for state in [
      NetworkState::Offline,
      NetworkState::Online,
      NetworkState::Online,
      NetworkState::Offline,
      NetworkState::Online,
    ] {
      monitor.set_state(state);
      tokio::time::sleep(step).await;
    }

    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    drop(monitor);
    task.await.unwrap();
  }

  #[tokio::test]
  async fn test_health_check_marks_unreachable_server_offline() {
    let monitor = NetworkMonitor::new(NetworkState::Online);
    let mut rx = monitor.subscribe();
    // Bind then release a port so nothing is listening on it
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap();
    let probe = monitor.spawn_health_probe(
      Client::new(),
      format!("http://{}/health", addr),
      Duration::from_secs(5),
    );

    rx.wait_for(|s| *s == NetworkState::Offline).await.unwrap();
    probe.abort();
  }
}
