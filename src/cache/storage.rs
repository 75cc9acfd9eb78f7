//! Byte-budgeted resource store on SQLite.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Transaction};

use super::resource::{CacheReceipt, CacheStats, CachedResource};
use crate::db::{parse_datetime, Database};
use crate::error::CacheOverflow;

/// Resource cache bounded by `budget` bytes, evicting the oldest `cached_at` first.
///
/// Every mutation rewrites `cache_meta.total_size` inside the same transaction.
#[derive(Clone)]
pub struct ResourceCache {
  db: Database,
  budget: u64,
}

/// Fixed-width UTC text, so `ORDER BY cached_at` is chronological.
fn stamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Recompute the stored total from the resident rows.
fn sync_total(tx: &Transaction<'_>) -> Result<u64> {
  let total: i64 = tx
    .query_row("SELECT COALESCE(SUM(size), 0) FROM resource_cache", [], |row| {
      row.get(0)
    })
    .map_err(|e| eyre!("Failed to sum cache sizes: {}", e))?;
  tx.execute(
    "UPDATE cache_meta SET total_size = ? WHERE id = 1",
    params![total],
  )
  .map_err(|e| eyre!("Failed to update cache metadata: {}", e))?;
  Ok(total as u64)
}

impl ResourceCache {
  pub fn new(db: Database, budget: u64) -> Self {
    Self { db, budget }
  }

  pub fn budget(&self) -> u64 {
    self.budget
  }

  /// Store a resource stamped with the current time, evicting the oldest
  /// entries until it fits. The caller's `cached_at` is ignored.
  ///
  /// A resource larger than the whole budget fails with [`CacheOverflow`]
  /// and leaves the cache untouched.
  pub fn put(&self, resource: &CachedResource) -> Result<CacheReceipt> {
    if resource.size > self.budget {
      return Err(
        CacheOverflow {
          id: resource.id.clone(),
          size: resource.size,
          budget: self.budget,
        }
        .into(),
      );
    }

    let cached_at = Utc::now();
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let replaced = tx
      .execute(
        "DELETE FROM resource_cache WHERE id = ?",
        params![resource.id],
      )
      .map_err(|e| eyre!("Failed to replace {}: {}", resource.id, e))?
      > 0;

    let mut total = sync_total(&tx)?;
    let mut evicted = Vec::new();
    while total + resource.size > self.budget {
      let oldest: Option<(i64, String, i64)> = tx
        .query_row(
          "SELECT seq, id, size FROM resource_cache ORDER BY cached_at, seq LIMIT 1",
          [],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to find eviction candidate: {}", e))?;

      let Some((seq, id, size)) = oldest else {
        return Err(eyre!("Cache accounting drifted: {} bytes with no entries", total));
      };
      tx.execute("DELETE FROM resource_cache WHERE seq = ?", params![seq])
        .map_err(|e| eyre!("Failed to evict {}: {}", id, e))?;
      total = total.saturating_sub(size as u64);
      evicted.push(id);
    }

    tx.execute(
      "INSERT INTO resource_cache (id, payload, size, cached_at) VALUES (?, ?, ?, ?)",
      params![
        resource.id,
        resource.payload,
        resource.size as i64,
        stamp(cached_at)
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", resource.id, e))?;

    let total = sync_total(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if !evicted.is_empty() {
      tracing::info!(id = %resource.id, evicted = ?evicted, total, budget = self.budget, "evicted to make room");
    }
    Ok(CacheReceipt {
      evicted,
      replaced,
      cached_at,
    })
  }

  pub fn get(&self, id: &str) -> Result<Option<CachedResource>> {
    let row: Option<(String, Vec<u8>, i64, String)> = self
      .db
      .lock()?
      .query_row(
        "SELECT id, payload, size, cached_at FROM resource_cache WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", id, e))?;

    row
      .map(|(id, payload, size, cached_at)| {
        Ok(CachedResource {
          id,
          payload,
          size: size as u64,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .transpose()
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    let removed = tx
      .execute("DELETE FROM resource_cache WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove {}: {}", id, e))?;
    sync_total(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(removed > 0)
  }

  pub fn clear_all(&self) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute("DELETE FROM resource_cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    sync_total(&tx)?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  /// Evict entries cached more than `max_age` ago and stamp the cleanup time.
  pub fn cleanup(&self, max_age: Duration) -> Result<Vec<String>> {
    let now = Utc::now();
    let cutoff = now - max_age;

    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entries: Vec<(String, String)> = {
      let mut stmt = tx
        .prepare("SELECT id, cached_at FROM resource_cache ORDER BY seq")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;
      rows
    };

    let mut expired = Vec::new();
    for (id, cached_at) in entries {
      if parse_datetime(&cached_at)? < cutoff {
        tx.execute("DELETE FROM resource_cache WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to expire {}: {}", id, e))?;
        expired.push(id);
      }
    }

    sync_total(&tx)?;
    tx.execute(
      "UPDATE cache_meta SET last_cleanup = ? WHERE id = 1",
      params![stamp(now)],
    )
    .map_err(|e| eyre!("Failed to stamp cleanup: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    tracing::debug!(expired = expired.len(), "cache cleanup");
    Ok(expired)
  }

  /// Resident ids in eviction order.
  pub fn resident_ids(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT id FROM resource_cache ORDER BY cached_at, seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let ids = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;
    Ok(ids)
  }

  pub fn stats(&self) -> Result<CacheStats> {
    let (total_size, count, last_cleanup): (i64, i64, Option<String>) = self
      .db
      .lock()?
      .query_row(
        "SELECT m.total_size, (SELECT COUNT(*) FROM resource_cache), m.last_cleanup
         FROM cache_meta m WHERE m.id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .map_err(|e| eyre!("Failed to read cache metadata: {}", e))?;

    let total_size = total_size as u64;
    let usage_percent = if self.budget == 0 {
      0.0
    } else {
      total_size as f64 / self.budget as f64 * 100.0
    };

    Ok(CacheStats {
      total_size,
      count: count as usize,
      budget: self.budget,
      usage_percent,
      last_cleanup: last_cleanup.as_deref().map(parse_datetime).transpose()?,
    })
  }

  /// When `cleanup` last ran.
  pub fn last_cleanup(&self) -> Result<Option<DateTime<Utc>>> {
    Ok(self.stats()?.last_cleanup)
  }

  /// Rewrite an entry's stamp, for tests that need aged entries.
  #[cfg(test)]
  pub(crate) fn backdate(&self, id: &str, cached_at: DateTime<Utc>) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "UPDATE resource_cache SET cached_at = ? WHERE id = ?",
        params![stamp(cached_at), id],
      )
      .map_err(|e| eyre!("Failed to backdate {}: {}", id, e))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cache(budget: u64) -> ResourceCache {
    ResourceCache::new(Database::open_in_memory().unwrap(), budget)
  }

  fn blob(id: &str, size: usize) -> CachedResource {
    CachedResource::new(id, vec![0u8; size])
  }

  fn true_total(cache: &ResourceCache) -> u64 {
    cache
      .resident_ids()
      .unwrap()
      .iter()
      .map(|id| cache.get(id).unwrap().unwrap().size)
      .sum()
  }

  #[test]
  fn test_budget_scenario() {
    let cache = cache(100);

    cache.put(&blob("A", 60)).unwrap();
    let receipt = cache.put(&blob("B", 50)).unwrap();
    assert_eq!(receipt.evicted, vec!["A".to_string()]);
    assert_eq!(cache.resident_ids().unwrap(), vec!["B"]);
    assert_eq!(cache.stats().unwrap().total_size, 50);

    cache.put(&blob("C", 10)).unwrap();
    assert_eq!(cache.resident_ids().unwrap(), vec!["B", "C"]);
    assert_eq!(cache.stats().unwrap().total_size, 60);

    let receipt = cache.put(&blob("B", 50)).unwrap();
    assert!(receipt.replaced);
    assert!(receipt.evicted.is_empty());
    assert_eq!(cache.resident_ids().unwrap(), vec!["C", "B"]);
    assert_eq!(cache.stats().unwrap().total_size, 60);
  }

  #[test]
  fn test_oversized_rejected_and_cache_untouched() {
    let cache = cache(100);
    cache.put(&blob("A", 40)).unwrap();

    let err = cache.put(&blob("huge", 101)).unwrap_err();
    let overflow = err.downcast_ref::<CacheOverflow>().unwrap();
    assert_eq!(overflow.size, 101);
    assert_eq!(overflow.budget, 100);

    assert_eq!(cache.resident_ids().unwrap(), vec!["A"]);
    assert_eq!(cache.stats().unwrap().total_size, 40);
  }

  #[test]
  fn test_exact_budget_fits() {
    let cache = cache(100);
    cache.put(&blob("A", 30)).unwrap();
    let receipt = cache.put(&blob("B", 100)).unwrap();
    assert_eq!(receipt.evicted, vec!["A".to_string()]);
    assert_eq!(cache.stats().unwrap().usage_percent, 100.0);
  }

  #[test]
  fn test_metadata_matches_resident_sum() {
    let cache = cache(1_000);
    let sizes = [120usize, 300, 80, 450, 10, 600, 220, 5, 999, 75, 310];

    for (i, size) in sizes.iter().enumerate() {
      cache.put(&blob(&format!("r{}", i % 4), *size)).unwrap();
      let stats = cache.stats().unwrap();
      assert!(stats.total_size <= stats.budget);
      assert_eq!(stats.total_size, true_total(&cache));
      // Newest entry always resident
      assert_eq!(
        cache.resident_ids().unwrap().last().cloned(),
        Some(format!("r{}", i % 4))
      );
    }

    cache.remove("r2").unwrap();
    assert_eq!(cache.stats().unwrap().total_size, true_total(&cache));

    cache.clear_all().unwrap();
    let stats = cache.stats().unwrap();
    assert_eq!((stats.total_size, stats.count), (0, 0));
  }

  #[test]
  fn test_eviction_follows_cached_at() {
    let cache = cache(100);
    cache.put(&blob("newer", 40)).unwrap();
    cache.put(&blob("older", 40)).unwrap();
    cache.backdate("older", Utc::now() - Duration::hours(1)).unwrap();
    assert_eq!(cache.resident_ids().unwrap(), vec!["older", "newer"]);

    let receipt = cache.put(&blob("incoming", 40)).unwrap();
    assert_eq!(receipt.evicted, vec!["older".to_string()]);
    assert_eq!(cache.resident_ids().unwrap(), vec!["newer", "incoming"]);
    assert_eq!(cache.stats().unwrap().total_size, 80);
  }

  #[test]
  fn test_recache_refreshes_cached_at() {
    let cache = cache(100);
    let mut r = blob("r", 10);
    r.cached_at = Utc::now() - Duration::hours(3);

    let first = cache.put(&r).unwrap();
    assert!(Utc::now() - first.cached_at < Duration::seconds(5));
    cache.backdate("r", Utc::now() - Duration::hours(3)).unwrap();

    let before = Utc::now();
    let second = cache.put(&r).unwrap();
    assert!(second.replaced);
    let stored = cache.get("r").unwrap().unwrap();
    assert_eq!(stored.cached_at, second.cached_at);
    assert!(stored.cached_at >= before);
  }

  #[test]
  fn test_cleanup_expires_old_entries() {
    let cache = cache(100);
    cache.put(&blob("old", 10)).unwrap();
    cache.backdate("old", Utc::now() - Duration::hours(2)).unwrap();
    cache.put(&blob("new", 10)).unwrap();
    assert!(cache.last_cleanup().unwrap().is_none());

    let expired = cache.cleanup(Duration::hours(1)).unwrap();
    assert_eq!(expired, vec!["old".to_string()]);
    assert_eq!(cache.resident_ids().unwrap(), vec!["new"]);
    assert_eq!(cache.stats().unwrap().total_size, 10);
    assert!(cache.last_cleanup().unwrap().is_some());
  }

  #[test]
  fn test_payload_roundtrip() {
    let cache = cache(100);
    let r = CachedResource::content_addressed(b"lecture-notes".to_vec());
    let receipt = cache.put(&r).unwrap();

    let got = cache.get(&r.id).unwrap().unwrap();
    assert_eq!(got.payload, r.payload);
    assert_eq!(got.size, r.size);
    assert_eq!(got.cached_at, receipt.cached_at);
    assert!(cache.get("missing").unwrap().is_none());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let (stored_at, cleaned_at) = {
      let cache = ResourceCache::new(Database::open(Some(&path)).unwrap(), 100);
      cache.put(&blob("stale", 10)).unwrap();
      cache.backdate("stale", Utc::now() - Duration::hours(2)).unwrap();
      cache.put(&blob("A", 30)).unwrap();
      let receipt = cache.put(&CachedResource::new("B", b"slides".to_vec())).unwrap();
      cache.cleanup(Duration::hours(1)).unwrap();
      (receipt.cached_at, cache.last_cleanup().unwrap().unwrap())
    };

    let cache = ResourceCache::new(Database::open(Some(&path)).unwrap(), 100);
    assert_eq!(cache.resident_ids().unwrap(), vec!["A", "B"]);
    assert_eq!(cache.stats().unwrap().total_size, 36);
    assert_eq!(true_total(&cache), 36);

    let b = cache.get("B").unwrap().unwrap();
    assert_eq!(b.payload, b"slides");
    assert_eq!(b.cached_at, stored_at);
    assert_eq!(cache.last_cleanup().unwrap(), Some(cleaned_at));
  }
}
