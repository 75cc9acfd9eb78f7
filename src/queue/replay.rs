//! Replay of queued actions against the server.

use color_eyre::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::action::QueuedAction;
use super::store::ActionQueue;
use crate::error::ReplayError;

/// Delivers one queued action to the server.
pub trait ActionDispatcher: Send + Sync + 'static {
  fn dispatch<'a>(&'a self, action: &'a QueuedAction) -> BoxFuture<'a, Result<(), ReplayError>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  pub success_count: usize,
  pub failed_count: usize,
  /// Ids at the retry cap; they stay queued until reset or discarded
  pub exhausted: Vec<String>,
  /// Unsynced actions left after the pass
  pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  Completed(SyncSummary),
  /// Another pass was in flight; nothing was done
  AlreadyRunning,
}

impl SyncOutcome {
  pub fn summary(&self) -> Option<&SyncSummary> {
    match self {
      Self::Completed(summary) => Some(summary),
      Self::AlreadyRunning => None,
    }
  }
}

/// Runs replay passes one at a time.
#[derive(Clone)]
pub struct Replayer {
  queue: ActionQueue,
  dispatcher: Arc<dyn ActionDispatcher>,
  running: Arc<Mutex<()>>,
}

impl Replayer {
  pub fn new(queue: ActionQueue, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
    Self {
      queue,
      dispatcher,
      running: Arc::new(Mutex::new(())),
    }
  }

  /// Dispatch every replayable action in order, then purge what succeeded.
  ///
  /// A failed item is counted and the pass moves on.
  pub async fn sync(&self) -> Result<SyncOutcome> {
    let Ok(_guard) = self.running.try_lock() else {
      info!("replay already in progress");
      return Ok(SyncOutcome::AlreadyRunning);
    };

    let mut summary = SyncSummary::default();
    for action in self.queue.replayable()? {
      match self.dispatcher.dispatch(&action).await {
        Ok(()) => {
          self.queue.mark_synced(&action.id)?;
          summary.success_count += 1;
        }
        Err(e) => {
          let retries = self.queue.record_failure(&action.id, &e.to_string())?;
          warn!(id = %action.id, kind = %action.kind, operation = %action.operation, retries, error = %e, "replay failed");
          summary.failed_count += 1;
        }
      }
    }

    self.queue.purge_synced()?;
    summary.exhausted = self
      .queue
      .exhausted()?
      .into_iter()
      .map(|a| a.id)
      .collect();
    summary.remaining = self.queue.len()?;

    info!(
      success = summary.success_count,
      failed = summary.failed_count,
      exhausted = summary.exhausted.len(),
      remaining = summary.remaining,
      "replay finished"
    );
    Ok(SyncOutcome::Completed(summary))
  }
}
