//! Durable log of user actions awaiting replay.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::action::{ActionKind, Operation, QueuedAction};
use crate::db::{parse_datetime, Database};

const SELECT_COLUMNS: &str =
  "SELECT id, kind, operation, payload, created_at, synced, retry_count, last_error FROM offline_actions";

/// Ordered action log on top of the shared database.
#[derive(Clone)]
pub struct ActionQueue {
  db: Database,
  max_retries: u32,
}

/// Raw row, decoded outside the rusqlite closure so parse errors carry context.
struct ActionRow {
  id: String,
  kind: String,
  operation: String,
  payload: String,
  created_at: String,
  synced: bool,
  retry_count: u32,
  last_error: Option<String>,
}

impl ActionRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      kind: row.get(1)?,
      operation: row.get(2)?,
      payload: row.get(3)?,
      created_at: row.get(4)?,
      synced: row.get(5)?,
      retry_count: row.get(6)?,
      last_error: row.get(7)?,
    })
  }

  fn into_action(self) -> Result<QueuedAction> {
    let payload: Value = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Corrupt payload for action {}: {}", self.id, e))?;
    Ok(QueuedAction {
      kind: ActionKind::from(self.kind),
      operation: self.operation.parse()?,
      payload,
      created_at: parse_datetime(&self.created_at)?,
      synced: self.synced,
      retry_count: self.retry_count,
      last_error: self.last_error,
      id: self.id,
    })
  }
}

impl ActionQueue {
  pub fn new(db: Database, max_retries: u32) -> Self {
    Self { db, max_retries }
  }

  /// Record an action. It is durable once this returns.
  pub fn enqueue(
    &self,
    kind: ActionKind,
    operation: Operation,
    payload: Value,
  ) -> Result<QueuedAction> {
    let action = QueuedAction::new(kind, operation, payload);
    let payload =
      serde_json::to_string(&action.payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    self
      .db
      .lock()?
      .execute(
        "INSERT INTO offline_actions (id, kind, operation, payload, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          action.id,
          action.kind.as_str(),
          action.operation.as_str(),
          payload,
          action.created_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue action: {}", e))?;

    tracing::debug!(id = %action.id, kind = %action.kind, operation = %action.operation, "action queued");
    Ok(action)
  }

  fn select(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<QueuedAction>> {
    let conn = self.db.lock()?;
    let sql = format!("{} {}", SELECT_COLUMNS, clause);
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<ActionRow> = stmt
      .query_map(args, ActionRow::from_row)
      .map_err(|e| eyre!("Failed to query actions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read action row: {}", e))?;

    rows.into_iter().map(ActionRow::into_action).collect()
  }

  /// Every unsynced action in enqueue order, exhausted ones included.
  pub fn pending(&self) -> Result<Vec<QueuedAction>> {
    self.select("WHERE synced = 0 ORDER BY seq", [])
  }

  /// Unsynced actions still under the retry cap, in enqueue order.
  pub fn replayable(&self) -> Result<Vec<QueuedAction>> {
    self.select(
      "WHERE synced = 0 AND retry_count < ? ORDER BY seq",
      params![self.max_retries],
    )
  }

  /// Unsynced actions that hit the retry cap and will not be dispatched again.
  pub fn exhausted(&self) -> Result<Vec<QueuedAction>> {
    self.select(
      "WHERE synced = 0 AND retry_count >= ? ORDER BY seq",
      params![self.max_retries],
    )
  }

  pub fn get(&self, id: &str) -> Result<Option<QueuedAction>> {
    let conn = self.db.lock()?;
    let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
    let row = conn
      .query_row(&sql, params![id], ActionRow::from_row)
      .optional()
      .map_err(|e| eyre!("Failed to load action {}: {}", id, e))?;
    drop(conn);
    row.map(ActionRow::into_action).transpose()
  }

  /// Number of unsynced actions.
  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row("SELECT COUNT(*) FROM offline_actions WHERE synced = 0", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count actions: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn mark_synced(&self, id: &str) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "UPDATE offline_actions SET synced = 1, last_error = NULL WHERE id = ?",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark action {} synced: {}", id, e))?;
    Ok(())
  }

  /// Count one failed dispatch. Returns the new retry count.
  pub fn record_failure(&self, id: &str, error: &str) -> Result<u32> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE offline_actions SET retry_count = retry_count + 1, last_error = ? WHERE id = ?",
      params![error, id],
    )
    .map_err(|e| eyre!("Failed to record failure for {}: {}", id, e))?;

    let retries: u32 = tx
      .query_row(
        "SELECT retry_count FROM offline_actions WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Action {} vanished while recording failure: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(retries)
  }

  /// Delete every synced action. Returns how many were removed.
  pub fn purge_synced(&self) -> Result<usize> {
    self
      .db
      .lock()?
      .execute("DELETE FROM offline_actions WHERE synced = 1", [])
      .map_err(|e| eyre!("Failed to purge synced actions: {}", e))
  }

  /// Give an exhausted action a fresh set of retries.
  pub fn reset_retries(&self, id: &str) -> Result<bool> {
    let changed = self
      .db
      .lock()?
      .execute(
        "UPDATE offline_actions SET retry_count = 0 WHERE id = ? AND synced = 0",
        params![id],
      )
      .map_err(|e| eyre!("Failed to reset retries for {}: {}", id, e))?;
    Ok(changed > 0)
  }

  /// Drop an action without syncing it.
  pub fn discard(&self, id: &str) -> Result<bool> {
    let changed = self
      .db
      .lock()?
      .execute("DELETE FROM offline_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to discard action {}: {}", id, e))?;
    if changed > 0 {
      tracing::info!(id, "action discarded");
    }
    Ok(changed > 0)
  }
}
