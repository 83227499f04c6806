//! Request-facing filesystem operations over a [`CacheStore`].
//!
//! [`KvFs`] is what a request layer (FUSE, a CLI, tests) talks to. Each call takes absolute
//! `/`-separated paths, returns [`crate::Result`], and leaves it to the caller to turn errors into
//! status codes with [`Error::errno`]. Paths are normalized on the way in; relative paths and
//! `.`/`..` components fail with [`Error::InvalidPath`].
//!
//! Lock discipline: path lookups only happen while no lock is held. Directory entry locks are
//! taken in path order, and inode locks only after the entry locks a call needs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use bytes::Bytes;
use tracing::{debug, error, instrument, warn};

use crate::backend::KvBackend;
use crate::cache::flusher::{DEFAULT_ESCALATION_THRESHOLD, DEFAULT_FLUSH_INTERVAL};
use crate::cache::{
    BackgroundFlusher, CacheStore, DirectoryOpenContext, Exclusive, LockMode, OpenContext, Shared,
    StoreOptions, Unlocked,
};
use crate::error::{Error, Result};
use crate::indexing::{ROOT, file_name, normalize, parent_of};
use crate::node::{
    Attributes, FileKind, MODE_DIRECTORY, MODE_REGULAR, MODE_TYPE_MASK, Metadata, Permissions,
};

/// Type representing a file handle.
pub type FileHandle = u64;

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

/// Everything needed to mount a backend.
#[derive(Debug)]
pub struct MountOptions {
    /// Layout and retention of cached objects.
    pub store: StoreOptions,
    /// Time between background flush cycles. `None` disables the background flusher.
    pub flush_interval: Option<Duration>,
    /// Contended cycles tolerated before a flush cycle blocks on its locks.
    pub escalation_threshold: u32,
    /// Owner of newly created objects.
    pub owner: u32,
    /// Group of newly created objects.
    pub group: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            store: StoreOptions::default(),
            flush_interval: Some(DEFAULT_FLUSH_INTERVAL),
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            owner: 0,
            group: 0,
        }
    }
}

/// A mounted filesystem.
///
/// Dropping it stops the background flusher, closes any handles still open, and flushes every
/// cached object.
#[derive(Debug)]
pub struct KvFs {
    flusher: Option<BackgroundFlusher>,
    store: Arc<CacheStore>,
    handles: scc::HashMap<FileHandle, Arc<Metadata>>,
    next_fh: AtomicU64,
    owner: u32,
    group: u32,
}

/// Name of `path` within its parent. The root has none.
fn child_name(path: &str) -> Result<&str> {
    if path == ROOT {
        return Err(Error::Busy {
            path: path.to_owned(),
        });
    }
    Ok(file_name(path))
}

impl KvFs {
    /// Mounts `backend`, creating an empty root directory if it has none.
    pub fn mount(backend: Arc<dyn KvBackend>, options: MountOptions) -> Result<Self> {
        let store = CacheStore::new(backend, options.store);
        store.ensure_root(options.owner, options.group, 0o755)?;

        let flusher = options
            .flush_interval
            .map(|interval| {
                BackgroundFlusher::spawn(&store, interval, options.escalation_threshold).map_err(
                    |e| Error::Backend {
                        code: e.raw_os_error().unwrap_or(libc::EIO),
                        message: format!("failed to start background flusher: {e}"),
                    },
                )
            })
            .transpose()?;

        debug!(
            indexing = store.indexing().name(),
            background_flush = flusher.is_some(),
            "mounted"
        );
        Ok(Self {
            flusher,
            store,
            handles: scc::HashMap::new(),
            next_fh: AtomicU64::new(1),
            owner: options.owner,
            group: options.group,
        })
    }

    /// The cache behind this filesystem.
    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Attributes of the object at `path`.
    pub fn getattr(&self, path: &str) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let file = self.store.open::<Shared>(path)?;
        let attributes = file.attributes();
        file.close()?;
        Ok(attributes)
    }

    fn open_regular<M: LockMode>(&self, path: &str) -> Result<OpenContext<M>> {
        let file = self.store.open::<M>(path)?;
        if file.attributes().kind == FileKind::Directory {
            return Err(Error::IsDirectory {
                path: path.to_owned(),
            });
        }
        Ok(file)
    }

    /// Opens `path`'s parent for adding `path` to it.
    fn parent_for_insert(&self, path: &str) -> Result<DirectoryOpenContext<Exclusive>> {
        let name = child_name(path).map_err(|_| Error::FileAlreadyExists {
            path: path.to_owned(),
        })?;
        let parent = self.store.open_directory::<Exclusive>(parent_of(path))?;
        if parent.get_entry(name).is_ok() {
            return Err(Error::FileAlreadyExists {
                path: path.to_owned(),
            });
        }
        Ok(parent)
    }

    /// Creates a directory with the permission bits of `mode`.
    #[instrument(name = "KvFs::mkdir", skip(self))]
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut parent = self.parent_for_insert(path)?;
        let child = self.store.create_directory::<Unlocked>(
            path,
            self.owner,
            self.group,
            MODE_DIRECTORY | (mode & !MODE_TYPE_MASK),
        )?;
        parent.add_file(file_name(path), &child.directory().metadata().inode());
        let attributes = child.attributes();
        child.close()?;
        parent.close()?;
        Ok(attributes)
    }

    /// Creates an empty regular file with the permission bits of `mode`.
    #[instrument(name = "KvFs::create", skip(self))]
    pub fn create(&self, path: &str, mode: u32) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut parent = self.parent_for_insert(path)?;
        let child = self.store.create::<Unlocked>(
            path,
            self.owner,
            self.group,
            MODE_REGULAR | (mode & !MODE_TYPE_MASK),
        )?;
        parent.add_file(file_name(path), &child.metadata().inode());
        let attributes = child.attributes();
        child.close()?;
        parent.close()?;
        Ok(attributes)
    }

    /// Reads up to `len` bytes at `offset`. Short at end of file.
    pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let file = self.open_regular::<Shared>(path)?;
        let mut buf = vec![0u8; len];
        let read = file.read(&mut buf, offset)?;
        buf.truncate(read);
        file.close()?;
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at `offset`, growing the file as needed.
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut file = self.open_regular::<Exclusive>(path)?;
        let written = file.write(data, offset)?;
        file.close()?;
        Ok(written)
    }

    /// Sets the size of the regular file at `path`.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut file = self.open_regular::<Exclusive>(path)?;
        file.truncate(size)?;
        file.close()
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut file = self.store.open::<Exclusive>(path)?;
        file.set_permissions(Permissions::from_mode(mode));
        let attributes = file.attributes();
        file.close()?;
        Ok(attributes)
    }

    /// Changes owner and/or group; `None` leaves the value alone.
    pub fn chown(&self, path: &str, owner: Option<u32>, group: Option<u32>) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut file = self.store.open::<Exclusive>(path)?;
        file.set_owner(owner, group);
        let attributes = file.attributes();
        file.close()?;
        Ok(attributes)
    }

    /// Sets access and/or modification times; `None` leaves the value alone.
    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<Attributes> {
        let path = normalize(path)?;
        let path: &str = &path;
        let mut file = self.store.open::<Exclusive>(path)?;
        file.set_times(atime, mtime);
        let attributes = file.attributes();
        file.close()?;
        Ok(attributes)
    }

    /// Lists the directory at `path`, `.` and `..` first, then entries in name order.
    pub fn readdir(&self, path: &str) -> Result<Vec<(String, FileKind)>> {
        let path = normalize(path)?;
        let path: &str = &path;
        let directory = self.store.open_directory::<Shared>(path)?;
        let mut listing = Vec::with_capacity(directory.number_of_files() + 2);
        listing.push((".".to_owned(), FileKind::Directory));
        listing.push(("..".to_owned(), FileKind::Directory));
        directory.fill_buffer(|entry| listing.push((entry.name().to_owned(), entry.kind())));
        directory.close()?;
        Ok(listing)
    }

    /// Removes the regular file at `path`.
    #[instrument(name = "KvFs::unlink", skip(self))]
    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let path: &str = &path;
        let name = child_name(path)?;
        let target = self.open_regular::<Unlocked>(path)?;
        let mut parent = self.store.open_directory::<Exclusive>(parent_of(path))?;
        parent.get_entry(name).map_err(|_| Error::FileDoesNotExist {
            path: path.to_owned(),
        })?;

        self.store.remove(target.relock::<Exclusive>()?)?;
        parent.remove_file(name);
        parent.close()
    }

    /// Removes the empty directory at `path`.
    #[instrument(name = "KvFs::rmdir", skip(self))]
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let path: &str = &path;
        let name = child_name(path)?;
        let target = self.store.open_directory::<Unlocked>(path)?;
        let mut parent = self.store.open_directory::<Exclusive>(parent_of(path))?;
        parent.get_entry(name).map_err(|_| Error::FileDoesNotExist {
            path: path.to_owned(),
        })?;

        self.store.remove_directory(target.relock::<Exclusive>()?)?;
        parent.remove_file(name);
        parent.close()
    }

    /// Moves the object at `old` to `new`.
    ///
    /// A regular file already at `new` is replaced. A directory at `new` is never replaced.
    #[instrument(name = "KvFs::rename", skip(self))]
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = normalize(old)?;
        let old: &str = &old;
        let new = normalize(new)?;
        let new: &str = &new;
        child_name(old)?;
        child_name(new)?;
        if old == new {
            return Ok(());
        }
        if new.strip_prefix(old).is_some_and(|rest| rest.starts_with('/')) {
            return Err(Error::InvalidRename {
                from: old.to_owned(),
                to: new.to_owned(),
            });
        }

        let kind = self.store.get_type(old)?;
        let new_parent = self.store.open_directory::<Unlocked>(parent_of(new))?;
        match self.store.get_type(new) {
            Ok(FileKind::Regular) if kind == FileKind::Regular => {
                debug!("replacing existing file");
                self.unlink(new)?;
            }
            Ok(FileKind::Regular) => {
                return Err(Error::IsNotDirectory {
                    path: new.to_owned(),
                });
            }
            Ok(FileKind::Directory) => {
                return Err(Error::FileAlreadyExists {
                    path: new.to_owned(),
                });
            }
            Err(Error::FileDoesNotExist { .. }) => {}
            Err(e) => return Err(e),
        }
        let old_parent = self.store.open_directory::<Unlocked>(parent_of(old))?;

        match kind {
            FileKind::Directory => self.store.move_directory(old, new)?,
            FileKind::Regular => self.store.move_file(old, new)?,
        }

        if parent_of(old) == parent_of(new) {
            drop(new_parent);
            let mut parent = old_parent.relock::<Exclusive>()?;
            parent.move_entry(old, new, None)?;
            return parent.close();
        }

        let (mut from, mut to) = if parent_of(old) < parent_of(new) {
            let from = old_parent.relock::<Exclusive>()?;
            (from, new_parent.relock::<Exclusive>()?)
        } else {
            let to = new_parent.relock::<Exclusive>()?;
            (old_parent.relock::<Exclusive>()?, to)
        };
        from.move_entry(old, new, Some(&mut *to))?;
        to.close()?;
        from.close()
    }

    /// Opens `path` and returns a handle that keeps it cached until [`KvFs::release`].
    #[instrument(name = "KvFs::open", skip(self))]
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let path = normalize(path)?;
        let path: &str = &path;
        let file = match self.store.open::<Unlocked>(path) {
            Ok(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                return Err(Error::FileAlreadyExists {
                    path: path.to_owned(),
                });
            }
            Ok(file) => file,
            Err(Error::FileDoesNotExist { .. }) if flags.contains(OpenFlags::CREAT) => {
                self.create(path, 0o644)?;
                self.store.open::<Unlocked>(path)?
            }
            Err(e) => return Err(e),
        };

        let metadata = if flags.contains(OpenFlags::TRUNC) {
            if file.attributes().kind == FileKind::Directory {
                return Err(Error::IsDirectory {
                    path: path.to_owned(),
                });
            }
            let mut file = file.relock::<Exclusive>()?;
            file.truncate(0)?;
            file.unlock_and_release()
        } else {
            file.unlock_and_release()
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        if let Err((_, metadata)) = self.handles.insert_sync(fh, metadata) {
            self.store.close(&metadata)?;
            return Err(Error::Backend {
                code: libc::EIO,
                message: format!("file handle {fh} is already in use"),
            });
        }
        Ok(fh)
    }

    /// Closes a handle returned by [`KvFs::open`].
    pub fn release(&self, fh: FileHandle) -> Result<()> {
        match self.handles.remove_sync(&fh) {
            Some((_, metadata)) => self.store.close(&metadata),
            None => {
                warn!(fh, "releasing an unknown file handle");
                Ok(())
            }
        }
    }

    /// Number of file handles currently open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Writes every cached change to the backend.
    pub fn flush_all(&self) -> Result<()> {
        self.store.flush_all()
    }
}

impl Drop for KvFs {
    fn drop(&mut self) {
        drop(self.flusher.take());

        let mut handles = Vec::new();
        self.handles.iter_sync(|fh, _| {
            handles.push(*fh);
            true
        });
        for fh in handles {
            if let Err(e) = self.release(fh) {
                error!(fh, error = %e, "failed to release file handle on unmount");
            }
        }

        if let Err(e) = self.store.flush_all() {
            error!(error = %e, "failed to flush on unmount");
        }
    }
}
