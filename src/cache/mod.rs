//! Byte-budgeted local cache for documents and other resources.
//!
//! - Entries are charged by payload size against a fixed budget
//! - Inserts evict the oldest-added entries until the new one fits
//! - Totals live in `cache_meta`, rewritten in the same transaction as each change
//! - `CacheLayer` serves stale entries when the network is unavailable

mod layer;
mod resource;
mod storage;

pub use layer::CacheLayer;
pub use resource::{CacheReceipt, CacheResult, CacheSource, CacheStats, CachedResource};
pub use storage::ResourceCache;
