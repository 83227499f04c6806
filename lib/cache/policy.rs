//! When cached objects are trusted and when they are dropped.

use std::time::Duration;

use crate::node::{Directory, Metadata};

/// Stateless predicates consulted on every cache hit and every close.
pub trait CachingPolicy: Send + Sync + std::fmt::Debug {
    /// Whether a cached copy can be served without reloading it from the backend.
    fn is_valid(&self, metadata: &Metadata) -> bool;

    /// Whether the entry should stay in the cache.
    fn keep_cache(&self, metadata: &Metadata) -> bool;

    /// [`CachingPolicy::is_valid`] for a directory.
    fn is_directory_valid(&self, directory: &Directory) -> bool {
        self.is_valid(directory.metadata())
    }

    /// [`CachingPolicy::keep_cache`] for a directory.
    fn keep_directory(&self, directory: &Directory) -> bool {
        self.keep_cache(directory.metadata())
    }
}

/// Keep an entry exactly as long as someone has it open.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictOnLastClose;

impl CachingPolicy for EvictOnLastClose {
    fn is_valid(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn keep_cache(&self, metadata: &Metadata) -> bool {
        metadata.open_count() > 0
    }
}

/// Keep a closed entry around for a grace period.
///
/// After the grace period a closed entry is both evictable and stale, so a cache hit on it reloads
/// from the backend.
#[derive(Debug, Clone, Copy)]
pub struct HoldClosedCacheFor {
    duration: Duration,
}

impl HoldClosedCacheFor {
    /// Holds closed entries for `duration`.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    fn within_grace(&self, metadata: &Metadata) -> bool {
        metadata.open_count() > 0 || metadata.last_close().elapsed() < self.duration
    }
}

impl CachingPolicy for HoldClosedCacheFor {
    fn is_valid(&self, metadata: &Metadata) -> bool {
        self.within_grace(metadata)
    }

    fn keep_cache(&self, metadata: &Metadata) -> bool {
        self.within_grace(metadata)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::node::{Inode, Volume};

    fn metadata() -> Metadata {
        let volume = Arc::new(Volume::new(Arc::new(MemoryBackend::new()), 16));
        Metadata::new("/f", Inode::create(volume, 0, 0, 0o100_644).unwrap())
    }

    #[test]
    fn evict_on_last_close_tracks_open_count() {
        let m = metadata();
        assert!(EvictOnLastClose.keep_cache(&m));
        m.release();
        assert!(!EvictOnLastClose.keep_cache(&m));
        assert!(EvictOnLastClose.is_valid(&m));
    }

    #[test]
    fn hold_closed_keeps_during_grace() {
        let m = metadata();
        m.release();
        m.stamp_close();

        let long = HoldClosedCacheFor::new(Duration::from_secs(3600));
        assert!(long.keep_cache(&m));
        assert!(long.is_valid(&m));

        let none = HoldClosedCacheFor::new(Duration::ZERO);
        assert!(!none.keep_cache(&m));
        assert!(!none.is_valid(&m));

        m.retain();
        assert!(none.keep_cache(&m));
    }
}
