//! The key-value object store this filesystem persists into.
//!
//! Everything above this module treats the store as a slow, failure-prone remote: every call may
//! block for a network round trip, and every call may fail. The only failure the cache layer
//! inspects is [`BackendError::KeyDoesNotExist`]; all others propagate with their native code.

mod dir;
mod memory;

pub use dir::DirBackend;
pub use memory::MemoryBackend;

use bytes::Bytes;
use thiserror::Error;

/// Failures a [`KvBackend`] may report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The addressed object does not exist.
    #[error("key does not exist: {key}")]
    KeyDoesNotExist {
        /// Printable form of the key.
        key: String,
    },

    /// Any other failure, with the backend's native status code.
    #[error("backend failure ({code}): {message}")]
    Failure {
        /// Native status code, errno-compatible where the backend allows.
        code: i32,
        /// Human-readable description.
        message: String,
    },
}

impl BackendError {
    /// Shorthand for a missing `key`.
    #[must_use]
    pub fn missing(key: &[u8]) -> Self {
        Self::KeyDoesNotExist {
            key: printable_key(key),
        }
    }
}

/// Renders a key for logs and error messages.
#[must_use]
pub fn printable_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// A flat key-value object store.
///
/// Keys are arbitrary byte strings that never contain a NUL byte. Objects are byte arrays that may
/// be written partially: a ranged put past the end of an object zero-extends it.
pub trait KvBackend: Send + Sync + std::fmt::Debug {
    /// Fetch the whole object stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Bytes, BackendError>;

    /// Read up to `buf.len()` bytes of the object at `offset`.
    ///
    /// Returns how many bytes were copied, which is short when the object ends first.
    fn get_range(&self, key: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, BackendError>;

    /// Replace the object stored under `key`.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError>;

    /// Overwrite part of the object stored under `key`, creating it if needed.
    fn put_at(&self, key: &[u8], offset: u64, value: &[u8]) -> Result<(), BackendError>;

    /// Whether an object is stored under `key`.
    fn exist(&self, key: &[u8]) -> Result<bool, BackendError>;

    /// Delete the object stored under `key`.
    fn remove(&self, key: &[u8]) -> Result<(), BackendError>;
}
