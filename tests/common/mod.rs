#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use kvfs::backend::{BackendError, KvBackend, MemoryBackend};
use kvfs::cache::{CacheStore, CachingPolicy, EvictOnLastClose, StoreOptions};
use kvfs::fs::{KvFs, MountOptions};
use kvfs::indexing::{FullPathIndexing, IndirectIndexing};

/// Small stripes so that short writes already span several stripe objects.
pub const STRIPE: u64 = 16;

/// A [`MemoryBackend`] that counts every call and can be told to fail writes.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    inner: MemoryBackend,
    gets: AtomicUsize,
    puts: AtomicUsize,
    removes: AtomicUsize,
    exists: AtomicUsize,
    fail_puts: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Whole-object and ranged reads.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Whole-object and ranged writes.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn exists(&self) -> usize {
        self.exists.load(Ordering::SeqCst)
    }

    /// Makes every subsequent put fail with `EIO` until turned off again.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn has_key(&self, key: &[u8]) -> bool {
        self.inner.exist(key).unwrap()
    }

    /// Every stored key that starts with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.inner
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect()
    }

    fn check_put(&self) -> Result<(), BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BackendError::Failure {
                code: libc::EIO,
                message: "injected failure".to_owned(),
            });
        }
        Ok(())
    }
}

impl KvBackend for RecordingBackend {
    fn get(&self, key: &[u8]) -> Result<Bytes, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn get_range(&self, key: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_range(key, offset, buf)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        self.check_put()?;
        self.inner.put(key, value)
    }

    fn put_at(&self, key: &[u8], offset: u64, value: &[u8]) -> Result<(), BackendError> {
        self.check_put()?;
        self.inner.put_at(key, offset, value)
    }

    fn exist(&self, key: &[u8]) -> Result<bool, BackendError> {
        self.exists.fetch_add(1, Ordering::SeqCst);
        self.inner.exist(key)
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    FullPath,
    Indirect,
}

pub const SCHEMES: [Scheme; 2] = [Scheme::FullPath, Scheme::Indirect];

pub fn store_options(scheme: Scheme, policy: Box<dyn CachingPolicy>) -> StoreOptions {
    StoreOptions {
        indexing: match scheme {
            Scheme::FullPath => Box::new(FullPathIndexing),
            Scheme::Indirect => Box::new(IndirectIndexing),
        },
        policy,
        stripe_size: STRIPE,
    }
}

/// Mount options with the background flusher off, so backend traffic is deterministic.
pub fn mount_options(scheme: Scheme, policy: Box<dyn CachingPolicy>) -> MountOptions {
    MountOptions {
        store: store_options(scheme, policy),
        flush_interval: None,
        owner: 1000,
        group: 100,
        ..MountOptions::default()
    }
}

pub fn mount(scheme: Scheme) -> (Arc<RecordingBackend>, KvFs) {
    mount_with(scheme, Box::new(EvictOnLastClose))
}

pub fn mount_with(scheme: Scheme, policy: Box<dyn CachingPolicy>) -> (Arc<RecordingBackend>, KvFs) {
    let backend = RecordingBackend::new();
    let fs = mount_on(&backend, scheme, policy);
    (backend, fs)
}

/// Mounts an existing backend again, as after an unmount.
pub fn mount_on(
    backend: &Arc<RecordingBackend>,
    scheme: Scheme,
    policy: Box<dyn CachingPolicy>,
) -> KvFs {
    let backend: Arc<dyn KvBackend> = Arc::clone(backend) as Arc<dyn KvBackend>;
    KvFs::mount(backend, mount_options(scheme, policy)).unwrap()
}

/// A bare store with a root directory and nothing else.
pub fn store(scheme: Scheme) -> (Arc<RecordingBackend>, Arc<CacheStore>) {
    let backend = RecordingBackend::new();
    let store = CacheStore::new(
        Arc::clone(&backend) as Arc<dyn KvBackend>,
        store_options(scheme, Box::new(EvictOnLastClose)),
    );
    store.ensure_root(0, 0, 0o755).unwrap();
    (backend, store)
}

/// `len` bytes of a repeating, position-dependent pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Polls `condition` until it holds, or panics after `timeout`.
pub fn wait_for(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("{what} did not happen within {timeout:?}");
}
