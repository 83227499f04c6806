//! Scoped handles tying a lock and an open count to one cache lookup.
//!
//! Every open-style call on the [`CacheStore`] returns a context. While it lives, the object it
//! refers to counts as open and, depending on the [`LockMode`], its lock is held. Dropping the
//! context (or calling `close`) releases both exactly once and lets the caching policy decide
//! whether the entry stays cached.
//!
//! The lock mode is part of the type, so mutation through a context that only holds the shared
//! lock does not compile:
//!
//! ```ignore
//! let mut file = store.open::<Exclusive>("/a")?;
//! file.write(b"hello", 0)?;
//!
//! let file = store.open::<Shared>("/a")?;
//! file.read(&mut buf, 0)?;
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};
use tracing::error;

use super::store::CacheStore;
use crate::error::Result;
use crate::node::{Attributes, Directory, DirectoryContent, Inode, Metadata};

mod sealed {
    pub trait Sealed {}
}

/// How much of an object's lock a context holds.
pub trait LockMode: sealed::Sealed + Sized + 'static {
    /// What holding an inode's lock looks like.
    type InodeGuard;
    /// What holding a directory's entry lock looks like.
    type ContentGuard;

    /// Acquires the inode lock, blocking until it is available.
    fn lock_inode(metadata: &Metadata) -> Self::InodeGuard;

    /// Acquires the entry lock, blocking until it is available.
    fn lock_content(directory: &Directory) -> Self::ContentGuard;

    /// Read access through a held inode guard, if the mode holds one.
    fn inode(guard: &Self::InodeGuard) -> Option<&Inode>;

    /// Read access through a held entry guard, if the mode holds one.
    fn content(guard: &Self::ContentGuard) -> Option<&DirectoryContent>;
}

/// Hold no lock; every access locks for its own duration.
#[derive(Debug)]
pub struct Unlocked;

/// Hold the shared lock for the life of the context.
#[derive(Debug)]
pub struct Shared;

/// Hold the exclusive lock for the life of the context.
#[derive(Debug)]
pub struct Exclusive;

impl sealed::Sealed for Unlocked {}
impl sealed::Sealed for Shared {}
impl sealed::Sealed for Exclusive {}

impl LockMode for Unlocked {
    type InodeGuard = ();
    type ContentGuard = ();

    fn lock_inode(_metadata: &Metadata) -> Self::InodeGuard {}

    fn lock_content(_directory: &Directory) -> Self::ContentGuard {}

    fn inode(_guard: &Self::InodeGuard) -> Option<&Inode> {
        None
    }

    fn content(_guard: &Self::ContentGuard) -> Option<&DirectoryContent> {
        None
    }
}

impl LockMode for Shared {
    type InodeGuard = ArcRwLockReadGuard<RawRwLock, Inode>;
    type ContentGuard = ArcRwLockReadGuard<RawRwLock, DirectoryContent>;

    fn lock_inode(metadata: &Metadata) -> Self::InodeGuard {
        metadata.shared_arc()
    }

    fn lock_content(directory: &Directory) -> Self::ContentGuard {
        directory.shared_arc()
    }

    fn inode(guard: &Self::InodeGuard) -> Option<&Inode> {
        Some(&**guard)
    }

    fn content(guard: &Self::ContentGuard) -> Option<&DirectoryContent> {
        Some(&**guard)
    }
}

impl LockMode for Exclusive {
    type InodeGuard = ArcRwLockWriteGuard<RawRwLock, Inode>;
    type ContentGuard = ArcRwLockWriteGuard<RawRwLock, DirectoryContent>;

    fn lock_inode(metadata: &Metadata) -> Self::InodeGuard {
        metadata.exclusive_arc()
    }

    fn lock_content(directory: &Directory) -> Self::ContentGuard {
        directory.exclusive_arc()
    }

    fn inode(guard: &Self::InodeGuard) -> Option<&Inode> {
        Some(&**guard)
    }

    fn content(guard: &Self::ContentGuard) -> Option<&DirectoryContent> {
        Some(&**guard)
    }
}

/// An open regular file (or a directory opened for its attributes).
///
/// Derefs to the [`Inode`] when the mode holds a lock: shared modes give `&Inode`, exclusive
/// gives `&mut Inode`.
pub struct OpenContext<M: LockMode> {
    store: Arc<CacheStore>,
    path: String,
    metadata: Arc<Metadata>,
    guard: Option<M::InodeGuard>,
    released: bool,
}

impl<M: LockMode> OpenContext<M> {
    /// Locks `metadata` for a new logical open.
    ///
    /// `counted` says the caller already incremented the open count on this open's behalf.
    pub(crate) fn new(
        store: Arc<CacheStore>,
        path: &str,
        metadata: Arc<Metadata>,
        counted: bool,
    ) -> Self {
        if !counted {
            metadata.retain();
        }
        let guard = Some(M::lock_inode(&metadata));
        Self {
            store,
            path: path.to_owned(),
            metadata,
            guard,
            released: false,
        }
    }

    /// The path this context was opened at.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The cache entry this context refers to.
    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Attribute snapshot, through the held lock when there is one.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.guard
            .as_ref()
            .and_then(M::inode)
            .map_or_else(|| self.metadata.attributes(), Inode::attributes)
    }

    /// Releases the open and reports any failure flushing an evicted entry.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Drops the lock but keeps the object open.
    ///
    /// The returned reference still counts as an open until it is handed back to
    /// [`CacheStore::close`].
    #[must_use = "the reference stays open until passed to CacheStore::close"]
    pub fn unlock_and_release(mut self) -> Arc<Metadata> {
        self.released = true;
        self.guard.take();
        Arc::clone(&self.metadata)
    }

    /// Trades this context for one holding the lock as `N` says, without a new lookup.
    ///
    /// See [`CacheStore::relock`].
    pub fn relock<N: LockMode>(self) -> Result<OpenContext<N>> {
        let store = Arc::clone(&self.store);
        let path = self.path.clone();
        store.relock(&path, self.unlock_and_release())
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.metadata.release();
        self.guard.take();
        self.metadata.stamp_close();
        self.store.drop_if_unused(&self.metadata)
    }
}

impl<M: LockMode> Drop for OpenContext<M> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(path = %self.path, error = %e, "failed to release open context");
        }
    }
}

impl<M: LockMode> std::fmt::Debug for OpenContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenContext")
            .field("path", &self.path)
            .field("mode", &std::any::type_name::<M>())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<M> Deref for OpenContext<M>
where
    M: LockMode,
    M::InodeGuard: Deref<Target = Inode>,
{
    type Target = Inode;

    fn deref(&self) -> &Inode {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("the guard is only taken when the context is consumed"),
        }
    }
}

impl<M> DerefMut for OpenContext<M>
where
    M: LockMode,
    M::InodeGuard: DerefMut<Target = Inode>,
{
    fn deref_mut(&mut self) -> &mut Inode {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("the guard is only taken when the context is consumed"),
        }
    }
}

/// An open directory.
///
/// Derefs to the [`DirectoryContent`] when the mode holds a lock. The directory's attributes are
/// reachable through [`DirectoryOpenContext::directory`].
pub struct DirectoryOpenContext<M: LockMode> {
    store: Arc<CacheStore>,
    path: String,
    directory: Arc<Directory>,
    guard: Option<M::ContentGuard>,
    released: bool,
}

impl<M: LockMode> DirectoryOpenContext<M> {
    /// Locks `directory` for a new logical open. See [`OpenContext::new`] for `counted`.
    pub(crate) fn new(
        store: Arc<CacheStore>,
        path: &str,
        directory: Arc<Directory>,
        counted: bool,
    ) -> Self {
        if !counted {
            directory.metadata().retain();
        }
        let guard = Some(M::lock_content(&directory));
        Self {
            store,
            path: path.to_owned(),
            directory,
            guard,
            released: false,
        }
    }

    /// The path this context was opened at.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The cached directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Attribute snapshot of the directory's inode.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.directory.metadata().attributes()
    }

    /// Persists entries and attributes, through the held lock when there is one.
    pub fn flush(&self) -> Result<()> {
        match self.guard.as_ref().and_then(M::content) {
            Some(content) => content.flush_into(&mut self.directory.metadata().inode_mut()),
            None => self.directory.flush(),
        }
    }

    /// Releases the open and reports any failure flushing an evicted entry.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Drops the lock but keeps the directory open until [`CacheStore::close_directory`].
    #[must_use = "the reference stays open until passed to CacheStore::close_directory"]
    pub fn unlock_and_release(mut self) -> Arc<Directory> {
        self.released = true;
        self.guard.take();
        Arc::clone(&self.directory)
    }

    /// Trades this context for one holding the entry lock as `N` says, without a new lookup.
    ///
    /// See [`CacheStore::relock_directory`].
    pub fn relock<N: LockMode>(self) -> Result<DirectoryOpenContext<N>> {
        let store = Arc::clone(&self.store);
        let path = self.path.clone();
        store.relock_directory(&path, self.unlock_and_release())
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let metadata = self.directory.metadata();
        metadata.release();
        self.guard.take();
        metadata.stamp_close();
        self.store.drop_directory_if_unused(&self.directory)
    }
}

impl<M: LockMode> Drop for DirectoryOpenContext<M> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(path = %self.path, error = %e, "failed to release directory context");
        }
    }
}

impl<M: LockMode> std::fmt::Debug for DirectoryOpenContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryOpenContext")
            .field("path", &self.path)
            .field("mode", &std::any::type_name::<M>())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<M> Deref for DirectoryOpenContext<M>
where
    M: LockMode,
    M::ContentGuard: Deref<Target = DirectoryContent>,
{
    type Target = DirectoryContent;

    fn deref(&self) -> &DirectoryContent {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("the guard is only taken when the context is consumed"),
        }
    }
}

impl<M> DerefMut for DirectoryOpenContext<M>
where
    M: LockMode,
    M::ContentGuard: DerefMut<Target = DirectoryContent>,
{
    fn deref_mut(&mut self) -> &mut DirectoryContent {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("the guard is only taken when the context is consumed"),
        }
    }
}
