//! The cache store and everything that hands out access to it.

/// Scoped handles returned by the store's open calls.
pub mod context;
/// Periodic write-back and eviction.
pub mod flusher;
/// When entries are trusted and when they are dropped.
pub mod policy;
/// The path-keyed object cache.
pub mod store;

pub use context::{DirectoryOpenContext, Exclusive, LockMode, OpenContext, Shared, Unlocked};
pub use flusher::BackgroundFlusher;
pub use policy::{CachingPolicy, EvictOnLastClose, HoldClosedCacheFor};
pub use store::{CacheStore, StoreOptions};
