use bytes::Bytes;
use tracing::trace;

use super::{BackendError, KvBackend};

/// A process-local [`KvBackend`] over a concurrent hash map.
///
/// Nothing survives the process. Useful for tests and for throwaway mounts.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: scc::HashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Snapshot of every stored key, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(self.objects.len());
        self.objects.iter_sync(|key, _| {
            keys.push(key.clone());
            true
        });
        keys.sort();
        keys
    }
}

fn to_index(offset: u64) -> Result<usize, BackendError> {
    usize::try_from(offset).map_err(|_| BackendError::Failure {
        code: libc::EFBIG,
        message: format!("offset {offset} does not fit in memory"),
    })
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Bytes, BackendError> {
        self.objects
            .read_sync(key, |_, value| Bytes::copy_from_slice(value))
            .ok_or_else(|| BackendError::missing(key))
    }

    fn get_range(&self, key: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, BackendError> {
        let start = to_index(offset)?;
        self.objects
            .read_sync(key, |_, value| {
                let Some(available) = value.get(start..) else {
                    return 0;
                };
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                n
            })
            .ok_or_else(|| BackendError::missing(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        trace!(key = %super::printable_key(key), len = value.len(), "put");
        self.objects.upsert_sync(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn put_at(&self, key: &[u8], offset: u64, value: &[u8]) -> Result<(), BackendError> {
        trace!(key = %super::printable_key(key), offset, len = value.len(), "put_at");
        let start = to_index(offset)?;
        let end = start + value.len();
        let mut entry = self.objects.entry_sync(key.to_vec()).or_default();
        let object = entry.get_mut();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(value);
        Ok(())
    }

    fn exist(&self, key: &[u8]) -> Result<bool, BackendError> {
        Ok(self.objects.read_sync(key, |_, _| ()).is_some())
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        self.objects
            .remove_sync(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::missing(key))
    }
}
