//! Error taxonomy shared by the transport, replay and cache components.
//!
//! Plumbing (storage, config, the facade) returns `color_eyre::Result`; these
//! typed errors mark the failures callers are expected to tell apart.

use std::time::Duration;

/// Socket-level failure. Always recoverable through the reconnect path.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("connect failed: {0}")]
  Connect(String),
  #[error("connect timed out after {0:?}")]
  ConnectTimeout(Duration),
  #[error("socket error: {0}")]
  Io(String),
  #[error("connection closed by peer")]
  ClosedByPeer,
  #[error("no pong within {0:?}")]
  HeartbeatTimeout(Duration),
  #[error("failed to encode message: {0}")]
  Encode(String),
  #[error("pending queue full ({capacity} messages)")]
  QueueFull { capacity: usize },
  #[error("connection was shut down")]
  Closed,
}

/// Dispatch of one queued action failed. Recorded on the item, never fatal to the pass.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplayError {
  #[error("network error: {0}")]
  Network(String),
  #[error("server rejected action with status {status}")]
  Rejected { status: u16 },
  #[error("payload is missing `{0}`")]
  MissingField(&'static str),
  #[error("`{0}` cannot be used as a path segment")]
  InvalidField(&'static str),
  #[error("{operation} is not supported for {kind}")]
  Unsupported { kind: String, operation: String },
}

/// A single resource is larger than the whole cache budget.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("resource {id} ({size} bytes) exceeds cache budget of {budget} bytes")]
pub struct CacheOverflow {
  pub id: String,
  pub size: u64,
  pub budget: u64,
}
