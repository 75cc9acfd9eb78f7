//! Cache-first reads with network refresh and offline fallback.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::future::Future;

use super::resource::{CacheResult, CachedResource};
use super::storage::ResourceCache;
use crate::error::CacheOverflow;

/// Sits between the application and a resource fetcher.
#[derive(Clone)]
pub struct CacheLayer {
  cache: ResourceCache,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl CacheLayer {
  pub fn new(cache: ResourceCache) -> Self {
    Self {
      cache,
      stale_time: Duration::minutes(5),
    }
  }

  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn cache(&self) -> &ResourceCache {
    &self.cache
  }

  fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Cache `resource`, taking the stamp the cache assigned it.
  fn store(&self, resource: &mut CachedResource) -> Result<()> {
    match self.cache.put(resource) {
      Ok(receipt) => {
        resource.cached_at = receipt.cached_at;
        Ok(())
      }
      Err(e) if e.downcast_ref::<CacheOverflow>().is_some() => {
        tracing::warn!(id = %resource.id, error = %e, "not caching oversized resource");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Fetch one resource with a cache-first strategy.
  ///
  /// 1. Fresh cache hit is returned immediately
  /// 2. Stale or missing entries are fetched and cached
  /// 3. If the fetch fails, a stale entry is served as `Offline`
  pub async fn fetch<F, Fut>(&self, id: &str, fetcher: F) -> Result<CacheResult<CachedResource>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<u8>>>,
  {
    if let Some(cached) = self.cache.get(id)? {
      if !self.is_stale(cached.cached_at) {
        let cached_at = cached.cached_at;
        return Ok(CacheResult::from_cache(cached, cached_at));
      }

      match fetcher().await {
        Ok(payload) => {
          let mut fresh = CachedResource::new(id, payload);
          self.store(&mut fresh)?;
          Ok(CacheResult::from_network(fresh))
        }
        Err(e) => {
          tracing::debug!(id, error = %e, "fetch failed, serving stale entry");
          let cached_at = cached.cached_at;
          Ok(CacheResult::offline(cached, cached_at))
        }
      }
    } else {
      let mut fresh = CachedResource::new(id, fetcher().await?);
      self.store(&mut fresh)?;
      Ok(CacheResult::from_network(fresh))
    }
  }
}
