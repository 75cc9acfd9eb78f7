use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// What a queued action mutates. Applications may add their own kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ActionKind {
  Highlight,
  Note,
  ViewRecord,
  Custom(String),
}

impl ActionKind {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Highlight => "highlight",
      Self::Note => "note",
      Self::ViewRecord => "view_record",
      Self::Custom(kind) => kind,
    }
  }
}

impl From<String> for ActionKind {
  fn from(s: String) -> Self {
    match s.as_str() {
      "highlight" => Self::Highlight,
      "note" => Self::Note,
      "view_record" => Self::ViewRecord,
      _ => Self::Custom(s),
    }
  }
}

impl From<&str> for ActionKind {
  fn from(s: &str) -> Self {
    Self::from(s.to_string())
  }
}

impl From<ActionKind> for String {
  fn from(kind: ActionKind) -> Self {
    kind.as_str().to_string()
  }
}

impl fmt::Display for ActionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl FromStr for Operation {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(eyre!("Unknown operation: {}", other)),
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A user mutation recorded for replay against the server API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  /// Generated at enqueue time; doubles as the server-side idempotency key
  pub id: String,
  pub kind: ActionKind,
  pub operation: Operation,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  pub retry_count: u32,
  /// Error from the most recent failed dispatch
  pub last_error: Option<String>,
}

impl QueuedAction {
  pub fn new(kind: ActionKind, operation: Operation, payload: Value) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      kind,
      operation,
      payload,
      created_at: Utc::now(),
      synced: false,
      retry_count: 0,
      last_error: None,
    }
  }
}
