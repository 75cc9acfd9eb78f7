//! Cached resource types and lookup results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// One entry in the resource cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
  pub id: String,
  pub payload: Vec<u8>,
  /// Bytes charged against the budget
  pub size: u64,
  /// Set by the cache on every store
  pub cached_at: DateTime<Utc>,
}

impl CachedResource {
  pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
    Self {
      id: id.into(),
      size: payload.len() as u64,
      payload,
      cached_at: Utc::now(),
    }
  }

  /// Resource keyed by the SHA-256 of its payload.
  pub fn content_addressed(payload: Vec<u8>) -> Self {
    let id = hex::encode(Sha256::digest(&payload));
    Self::new(id, payload)
  }
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
  pub total_size: u64,
  pub count: usize,
  pub budget: u64,
  pub usage_percent: f64,
  pub last_cleanup: Option<DateTime<Utc>>,
}

/// What a successful insert displaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReceipt {
  /// Ids evicted to make room, oldest first
  pub evicted: Vec<String>,
  /// Whether the id was already resident and got replaced
  pub replaced: bool,
  /// Stamp the entry was stored under
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache-first read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Stale entry served because the network fetch failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Network unavailable, serving a stale entry
  Offline,
}
