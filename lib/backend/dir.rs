use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, trace};

use super::{BackendError, KvBackend};

/// Longest hex run written as one path component.
const SEGMENT_LEN: usize = 200;

/// A [`KvBackend`] storing one file per object under a root directory.
///
/// File names are the lowercase hex encoding of the key, so no key needs escaping. Encodings
/// longer than [`SEGMENT_LEN`] are split into nested directories, each named after one run
/// followed by `+`, so that deep paths stay under the platform's name limit and a directory
/// never shadows an object file.
#[derive(Debug)]
pub struct DirBackend {
    root: PathBuf,
}

/// Convert an I/O error on `key` into a backend failure carrying its errno.
#[expect(
    clippy::wildcard_enum_match_arm,
    reason = "ErrorKind is non_exhaustive; EIO is the safe default"
)]
fn io_to_backend(key: &[u8], e: &std::io::Error) -> BackendError {
    if e.kind() == ErrorKind::NotFound {
        return BackendError::missing(key);
    }
    let code = e.raw_os_error().unwrap_or_else(|| match e.kind() {
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::AlreadyExists => libc::EEXIST,
        _ => libc::EIO,
    });
    BackendError::Failure {
        code,
        message: e.to_string(),
    }
}

impl DirBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        debug!(root = ?root, "opened directory backend");
        Ok(Self { root })
    }

    /// Where the store keeps its objects.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &[u8]) -> PathBuf {
        let name = hex::encode(key);
        let mut path = self.root.clone();
        let mut rest = name.as_str();
        while rest.len() > SEGMENT_LEN {
            let (segment, tail) = rest.split_at(SEGMENT_LEN);
            path.push(format!("{segment}+"));
            rest = tail;
        }
        path.push(rest);
        path
    }

    /// Path of `key`'s object, with the directories of a split name created.
    fn writable_path(&self, key: &[u8]) -> Result<PathBuf, BackendError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent().filter(|p| *p != self.root.as_path()) {
            std::fs::create_dir_all(parent).map_err(|e| io_to_backend(key, &e))?;
        }
        Ok(path)
    }
}

impl KvBackend for DirBackend {
    fn get(&self, key: &[u8]) -> Result<Bytes, BackendError> {
        std::fs::read(self.object_path(key))
            .map(Bytes::from)
            .map_err(|e| io_to_backend(key, &e))
    }

    fn get_range(&self, key: &[u8], offset: u64, buf: &mut [u8]) -> Result<usize, BackendError> {
        let file = File::open(self.object_path(key)).map_err(|e| io_to_backend(key, &e))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(io_to_backend(key, &e)),
            }
        }
        Ok(filled)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendError> {
        trace!(key = %super::printable_key(key), len = value.len(), "put");
        std::fs::write(self.writable_path(key)?, value).map_err(|e| io_to_backend(key, &e))
    }

    fn put_at(&self, key: &[u8], offset: u64, value: &[u8]) -> Result<(), BackendError> {
        trace!(key = %super::printable_key(key), offset, len = value.len(), "put_at");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.writable_path(key)?)
            .map_err(|e| io_to_backend(key, &e))?;
        file.write_all_at(value, offset)
            .map_err(|e| io_to_backend(key, &e))
    }

    fn exist(&self, key: &[u8]) -> Result<bool, BackendError> {
        self.object_path(key)
            .try_exists()
            .map_err(|e| io_to_backend(key, &e))
    }

    fn remove(&self, key: &[u8]) -> Result<(), BackendError> {
        std::fs::remove_file(self.object_path(key)).map_err(|e| io_to_backend(key, &e))
    }
}
