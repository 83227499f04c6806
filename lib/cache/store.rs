//! The owner of every live object on a mount.
//!
//! Two path-keyed maps hold the cached [`Metadata`] and [`Directory`] objects, each behind its
//! own reader/writer lock that only guards inserts and removals. Content is guarded by the
//! per-object locks, which are only taken after the map lock used to find the object is released.
//! When both map locks are needed the directory map is locked first. Backend I/O never happens
//! with a map lock held.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, info, instrument, warn};

use super::context::{DirectoryOpenContext, Exclusive, LockMode, OpenContext, Unlocked};
use super::policy::{CachingPolicy, EvictOnLastClose};
use crate::backend::KvBackend;
use crate::error::{Error, Result};
use crate::indexing::{IndexingScheme, IndirectIndexing, ROOT, join};
use crate::node::{
    DEFAULT_STRIPE_SIZE, Directory, FileKind, Inode, MODE_DIRECTORY, MODE_TYPE_MASK, Metadata,
    Volume,
};

/// How a [`CacheStore`] lays out and retains objects.
#[derive(Debug)]
pub struct StoreOptions {
    /// Path to key mapping.
    pub indexing: Box<dyn IndexingScheme>,
    /// Retention of closed entries.
    pub policy: Box<dyn CachingPolicy>,
    /// Size of each data stripe in bytes.
    pub stripe_size: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            indexing: Box::new(IndirectIndexing),
            policy: Box::new(EvictOnLastClose),
            stripe_size: DEFAULT_STRIPE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Lookup {
    Directory,
    Any,
}

/// Caches every open object of a mount and mediates all access to them.
#[derive(Debug)]
pub struct CacheStore {
    volume: Arc<Volume>,
    indexing: Box<dyn IndexingScheme>,
    policy: Box<dyn CachingPolicy>,
    metadata: RwLock<FxHashMap<String, Arc<Metadata>>>,
    directories: RwLock<FxHashMap<String, Arc<Directory>>>,
}

impl CacheStore {
    /// Creates an empty cache in front of `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, options: StoreOptions) -> Arc<Self> {
        debug!(
            indexing = options.indexing.name(),
            policy = ?options.policy,
            stripe_size = options.stripe_size,
            "creating cache store"
        );
        Arc::new(Self {
            volume: Arc::new(Volume::new(backend, options.stripe_size)),
            indexing: options.indexing,
            policy: options.policy,
            metadata: RwLock::new(FxHashMap::default()),
            directories: RwLock::new(FxHashMap::default()),
        })
    }

    /// Backend and stripe layout shared by every object.
    #[must_use]
    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    /// The configured indexing scheme.
    #[must_use]
    pub fn indexing(&self) -> &dyn IndexingScheme {
        self.indexing.as_ref()
    }

    /// The configured caching policy.
    #[must_use]
    pub fn policy(&self) -> &dyn CachingPolicy {
        self.policy.as_ref()
    }

    /// Whether `path` has a cached [`Metadata`].
    #[must_use]
    pub fn is_cached(&self, path: &str) -> bool {
        self.metadata.read().contains_key(path)
    }

    /// Whether `path` has a cached [`Directory`].
    #[must_use]
    pub fn is_directory_cached(&self, path: &str) -> bool {
        self.directories.read().contains_key(path)
    }

    /// Number of cached metadata entries.
    #[must_use]
    pub fn cached_metadata_count(&self) -> usize {
        self.metadata.read().len()
    }

    /// Number of cached directories.
    #[must_use]
    pub fn cached_directory_count(&self) -> usize {
        self.directories.read().len()
    }

    /// Finds or loads the metadata at `path` with one open already counted for the caller.
    fn open_metadata(self: &Arc<Self>, path: &str, lookup: Lookup) -> Result<Arc<Metadata>> {
        let hit = self.metadata.read().get(path).map(|metadata| {
            let valid = self.policy.is_valid(metadata);
            metadata.retain();
            (Arc::clone(metadata), valid)
        });

        if let Some((metadata, valid)) = hit {
            if !valid {
                debug!(path, "cached metadata is stale, reloading");
                if let Err(e) = metadata.reload() {
                    self.close(&metadata)?;
                    return Err(e.at_path(path));
                }
            }
            return Ok(metadata);
        }

        let key = match lookup {
            Lookup::Directory => self.indexing.existing_directory_key(self, path)?,
            Lookup::Any => self.indexing.existing_regular_file_key(self, path)?,
        };
        let on_disk = self
            .volume
            .backend()
            .get(&key)
            .map_err(|e| Error::from(e).at_path(path))?;
        let loaded = Arc::new(Metadata::new(
            path,
            Inode::load(Arc::clone(&self.volume), key, &on_disk)?,
        ));

        let mut map = self.metadata.write();
        match map.entry(path.to_owned()) {
            Entry::Occupied(existing) => {
                // Lost a race with a concurrent miss; share the winner.
                existing.get().retain();
                Ok(Arc::clone(existing.get()))
            }
            Entry::Vacant(slot) => {
                debug!(path, "loaded metadata");
                slot.insert(Arc::clone(&loaded));
                Ok(loaded)
            }
        }
    }

    /// Opens the object at `path`, holding its lock as `M` says.
    #[instrument(name = "CacheStore::open", skip(self))]
    pub fn open<M: LockMode>(self: &Arc<Self>, path: &str) -> Result<OpenContext<M>> {
        let metadata = self.open_metadata(path, Lookup::Any)?;
        Ok(OpenContext::new(Arc::clone(self), path, metadata, true))
    }

    /// Opens the directory at `path`, holding its entry lock as `M` says.
    #[instrument(name = "CacheStore::open_directory", skip(self))]
    pub fn open_directory<M: LockMode>(
        self: &Arc<Self>,
        path: &str,
    ) -> Result<DirectoryOpenContext<M>> {
        let hit = self.directories.read().get(path).map(|directory| {
            let valid = self.policy.is_directory_valid(directory);
            directory.metadata().retain();
            (Arc::clone(directory), valid)
        });

        if let Some((directory, valid)) = hit {
            if !valid {
                debug!(path, "cached directory is stale, reloading");
                if let Err(e) = directory.reload(path) {
                    self.close_directory(&directory)?;
                    return Err(e.at_path(path));
                }
            }
            return Ok(DirectoryOpenContext::new(
                Arc::clone(self),
                path,
                directory,
                true,
            ));
        }

        let metadata = self.open_metadata(path, Lookup::Directory)?;
        let parsed =
            match Directory::construct(path, Arc::clone(&metadata), self.indexing.identifier_len())
            {
                Ok(directory) => Arc::new(directory),
                Err(e) => {
                    self.close(&metadata)?;
                    return Err(e.at_path(path));
                }
            };

        let directory = {
            let mut directories = self.directories.write();
            match directories.entry(path.to_owned()) {
                Entry::Occupied(existing) => {
                    if !Arc::ptr_eq(existing.get().metadata(), &metadata) {
                        metadata.release();
                        existing.get().metadata().retain();
                    }
                    Arc::clone(existing.get())
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&parsed));
                    parsed
                }
            }
        };
        Ok(DirectoryOpenContext::new(
            Arc::clone(self),
            path,
            directory,
            true,
        ))
    }

    /// Locks an object kept open by [`OpenContext::unlock_and_release`] again.
    ///
    /// Consumes that open. Never touches the backend or the indexing scheme, so it is safe to call
    /// while holding a directory's entry lock. Fails if `path` no longer maps to `metadata`.
    pub fn relock<M: LockMode>(
        self: &Arc<Self>,
        path: &str,
        metadata: Arc<Metadata>,
    ) -> Result<OpenContext<M>> {
        let context = OpenContext::new(Arc::clone(self), path, metadata, true);
        let current = self
            .metadata
            .read()
            .get(path)
            .is_some_and(|cached| Arc::ptr_eq(cached, context.metadata()));
        if !current {
            return Err(Error::FileDoesNotExist {
                path: path.to_owned(),
            });
        }
        Ok(context)
    }

    /// [`CacheStore::relock`] for a directory kept open by
    /// [`DirectoryOpenContext::unlock_and_release`].
    pub fn relock_directory<M: LockMode>(
        self: &Arc<Self>,
        path: &str,
        directory: Arc<Directory>,
    ) -> Result<DirectoryOpenContext<M>> {
        let context = DirectoryOpenContext::new(Arc::clone(self), path, directory, true);
        let current = self
            .directories
            .read()
            .get(path)
            .is_some_and(|cached| Arc::ptr_eq(cached, context.directory()));
        if !current {
            return Err(Error::FileDoesNotExist {
                path: path.to_owned(),
            });
        }
        Ok(context)
    }

    /// Fresh attributes for `path` with a newly allocated key.
    fn allocate(&self, path: &str, owner: u32, group: u32, mode: u32) -> Result<Inode> {
        let kind = FileKind::from_mode(mode)?;
        let mut inode = Inode::create(Arc::clone(&self.volume), owner, group, mode)?;
        let key = match kind {
            FileKind::Directory => self.indexing.new_directory_key(path, &mut inode)?,
            FileKind::Regular => self.indexing.new_regular_file_key(path, &mut inode)?,
        };
        if self.volume.backend().exist(&key)? {
            return Err(Error::FileAlreadyExists {
                path: path.to_owned(),
            });
        }
        inode.set_key(key);
        Ok(inode)
    }

    /// Creates an object at `path`.
    ///
    /// The object only exists in the cache until it is flushed. Adding it to its parent's
    /// entries is up to the caller.
    #[instrument(name = "CacheStore::create", skip(self))]
    pub fn create<M: LockMode>(
        self: &Arc<Self>,
        path: &str,
        owner: u32,
        group: u32,
        mode: u32,
    ) -> Result<OpenContext<M>> {
        if self.is_cached(path) {
            return Err(Error::FileAlreadyExists {
                path: path.to_owned(),
            });
        }
        let metadata = Arc::new(Metadata::new(
            path,
            self.allocate(path, owner, group, mode)?,
        ));
        match self.metadata.write().entry(path.to_owned()) {
            Entry::Occupied(_) => {
                return Err(Error::FileAlreadyExists {
                    path: path.to_owned(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&metadata));
            }
        }
        debug!(path, "created object");
        Ok(OpenContext::new(Arc::clone(self), path, metadata, true))
    }

    /// Creates a directory at `path`. `mode` must carry the directory type bits.
    #[instrument(name = "CacheStore::create_directory", skip(self))]
    pub fn create_directory<M: LockMode>(
        self: &Arc<Self>,
        path: &str,
        owner: u32,
        group: u32,
        mode: u32,
    ) -> Result<DirectoryOpenContext<M>> {
        if FileKind::from_mode(mode)? != FileKind::Directory {
            return Err(Error::IsNotDirectory {
                path: path.to_owned(),
            });
        }
        if self.is_directory_cached(path) || self.is_cached(path) {
            return Err(Error::FileAlreadyExists {
                path: path.to_owned(),
            });
        }
        let metadata = Arc::new(Metadata::new(
            path,
            self.allocate(path, owner, group, mode)?,
        ));
        let directory = Arc::new(Directory::construct(
            path,
            Arc::clone(&metadata),
            self.indexing.identifier_len(),
        )?);
        {
            let mut directories = self.directories.write();
            let mut map = self.metadata.write();
            if directories.contains_key(path) || map.contains_key(path) {
                return Err(Error::FileAlreadyExists {
                    path: path.to_owned(),
                });
            }
            directories.insert(path.to_owned(), Arc::clone(&directory));
            map.insert(path.to_owned(), metadata);
        }
        debug!(path, "created directory");
        Ok(DirectoryOpenContext::new(
            Arc::clone(self),
            path,
            directory,
            true,
        ))
    }

    /// Ends an open kept alive by [`OpenContext::unlock_and_release`].
    ///
    /// The entry is found wherever it is cached now, even if it was moved while open.
    pub fn close(&self, metadata: &Arc<Metadata>) -> Result<()> {
        metadata.release();
        metadata.stamp_close();
        self.drop_if_unused(metadata)
    }

    /// Ends an open kept alive by [`DirectoryOpenContext::unlock_and_release`].
    pub fn close_directory(&self, directory: &Arc<Directory>) -> Result<()> {
        let metadata = directory.metadata();
        metadata.release();
        metadata.stamp_close();
        self.drop_directory_if_unused(directory)
    }

    /// Evicts `metadata` if the policy no longer wants it.
    ///
    /// The entry is flushed before it leaves the cache and only removed if nothing dirtied it
    /// in between. Its path is read with the maps locked, so a concurrent move cannot race it.
    pub(crate) fn drop_if_unused(&self, metadata: &Arc<Metadata>) -> Result<()> {
        if self.policy.keep_cache(metadata) {
            return Ok(());
        }
        metadata.flush()?;

        let evicted = {
            let directories = self.directories.read();
            let mut map = self.metadata.write();
            let path = metadata.path();
            if directories
                .get(&path)
                .is_some_and(|d| Arc::ptr_eq(d.metadata(), metadata))
            {
                // The directory entry owns this metadata and evicts it along with itself.
                return Ok(());
            }
            let removable = map.get(&path).is_some_and(|cached| {
                Arc::ptr_eq(cached, metadata)
                    && !self.policy.keep_cache(metadata)
                    && !metadata.is_dirty()
            });
            (removable && map.remove(&path).is_some()).then_some(path)
        };
        if let Some(path) = evicted {
            debug!(path, "evicted metadata");
        }
        Ok(())
    }

    /// Evicts `directory` if the policy no longer wants it, then its metadata.
    pub(crate) fn drop_directory_if_unused(&self, directory: &Arc<Directory>) -> Result<()> {
        if self.policy.keep_directory(directory) {
            return Ok(());
        }
        directory.flush()?;

        let evicted = {
            let mut directories = self.directories.write();
            let path = directory.metadata().path();
            let removable = directories.get(&path).is_some_and(|cached| {
                Arc::ptr_eq(cached, directory)
                    && !self.policy.keep_directory(directory)
                    && !directory.is_dirty()
            });
            (removable && directories.remove(&path).is_some()).then_some(path)
        };
        if let Some(path) = evicted {
            debug!(path, "evicted directory");
            self.drop_if_unused(directory.metadata())?;
        }
        Ok(())
    }

    /// Removes an entry from `map` if it still is `target`.
    fn erase<T>(map: &mut FxHashMap<String, Arc<T>>, path: &str, target: &T) {
        if map
            .get(path)
            .is_some_and(|cached| std::ptr::eq(Arc::as_ptr(cached), target))
        {
            map.remove(path);
        }
    }

    /// Deletes the regular file behind `context` from the backend and the cache.
    #[instrument(name = "CacheStore::remove", skip(self, context), fields(path = context.path()))]
    pub fn remove(&self, mut context: OpenContext<Exclusive>) -> Result<()> {
        let path = context.path().to_owned();
        if context.kind() == FileKind::Directory {
            return Err(Error::IsDirectory { path });
        }
        context.remove()?;

        let metadata = context.unlock_and_release();
        let remaining = metadata.release();
        metadata.stamp_close();
        if remaining > 0 {
            warn!(path, remaining, "removed a file that is still open");
        }
        Self::erase(&mut self.metadata.write(), &path, &metadata);
        debug!(path, "removed file");
        Ok(())
    }

    /// Deletes the empty directory behind `context` from the backend and the cache.
    #[instrument(
        name = "CacheStore::remove_directory",
        skip(self, context),
        fields(path = context.path())
    )]
    pub fn remove_directory(&self, context: DirectoryOpenContext<Exclusive>) -> Result<()> {
        let path = context.path().to_owned();
        if !context.is_empty() {
            return Err(Error::DirectoryNotEmpty { path });
        }
        context.directory().remove(&context)?;

        let directory = context.unlock_and_release();
        let metadata = directory.metadata();
        let remaining = metadata.release();
        metadata.stamp_close();
        if remaining > 0 {
            warn!(path, remaining, "removed a directory that is still open");
        }
        {
            let mut directories = self.directories.write();
            let mut map = self.metadata.write();
            Self::erase(&mut directories, &path, &directory);
            Self::erase(&mut map, &path, metadata);
        }
        debug!(path, "removed directory");
        Ok(())
    }

    fn ensure_vacant(&self, path: &str) -> Result<()> {
        if self.is_directory_cached(path) || self.is_cached(path) {
            return Err(Error::FileAlreadyExists {
                path: path.to_owned(),
            });
        }
        Ok(())
    }

    /// Gives `inode` the key it should have at `new_path`, moving its backend objects if the
    /// key changes.
    fn rekey(&self, new_path: &str, inode: &mut Inode) -> Result<()> {
        let new_key = match inode.kind() {
            FileKind::Directory => self.indexing.new_directory_key(new_path, inode)?,
            FileKind::Regular => self.indexing.new_regular_file_key(new_path, inode)?,
        };
        if new_key.as_slice() == inode.key() {
            return Ok(());
        }
        if self.volume.backend().exist(&new_key)? {
            return Err(Error::FileAlreadyExists {
                path: new_path.to_owned(),
            });
        }
        inode.relocate(new_key)
    }

    /// Moves the object at `old_path` to `new_path`.
    ///
    /// Updating the parent directories' entries is up to the caller, after this returns.
    #[instrument(name = "CacheStore::move_file", skip(self))]
    pub fn move_file(self: &Arc<Self>, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_vacant(new_path)?;
        let mut context = self.open::<Exclusive>(old_path)?;
        if context.metadata().open_count() > 1 {
            warn!(
                open = context.metadata().open_count() - 1,
                "moving a file other handles still have open"
            );
        }
        self.rekey(new_path, &mut context)?;

        let metadata = context.unlock_and_release();
        {
            let mut map = self.metadata.write();
            Self::erase(&mut map, old_path, &metadata);
            metadata.set_path(new_path);
            if map
                .insert(new_path.to_owned(), Arc::clone(&metadata))
                .is_some()
            {
                warn!(new_path, "replaced a cached entry while moving");
            }
        }
        debug!("moved file");
        self.close(&metadata)
    }

    /// Moves the directory at `old_path`, and everything below it, to `new_path`.
    ///
    /// When keys derive from paths every descendant is moved first, one at a time, with no lock
    /// held on this directory. Otherwise only cached descendants are re-pathed.
    #[instrument(name = "CacheStore::move_directory", skip(self))]
    pub fn move_directory(self: &Arc<Self>, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_vacant(new_path)?;
        let directory = self.open_directory::<Unlocked>(old_path)?.unlock_and_release();
        let result = self.move_directory_contents(old_path, new_path, &directory);
        let closed = self.close_directory(&directory);
        result.and(closed)
    }

    fn move_directory_contents(
        self: &Arc<Self>,
        old_path: &str,
        new_path: &str,
        directory: &Arc<Directory>,
    ) -> Result<()> {
        if self.indexing.relocates_on_rename() {
            let children: Vec<(String, FileKind)> = directory
                .content()
                .entries()
                .map(|entry| (entry.name().to_owned(), entry.kind()))
                .collect();
            for (name, kind) in children {
                let (from, to) = (join(old_path, &name), join(new_path, &name));
                match kind {
                    FileKind::Directory => self.move_directory(&from, &to)?,
                    FileKind::Regular => self.move_file(&from, &to)?,
                }
            }
        } else {
            self.repath_descendants(old_path, new_path);
        }

        directory.flush()?;
        self.rekey(new_path, &mut directory.metadata().inode_mut())?;

        {
            let mut directories = self.directories.write();
            let mut map = self.metadata.write();
            Self::erase(&mut directories, old_path, directory);
            Self::erase(&mut map, old_path, directory.metadata());
            directory.metadata().set_path(new_path);
            directories.insert(new_path.to_owned(), Arc::clone(directory));
            map.insert(new_path.to_owned(), Arc::clone(directory.metadata()));
        }
        debug!("moved directory");
        Ok(())
    }

    /// Re-keys cached entries below `old_path` to live below `new_path`.
    fn repath_descendants(&self, old_path: &str, new_path: &str) {
        fn repath<T>(
            map: &mut FxHashMap<String, Arc<T>>,
            old_prefix: &str,
            new_path: &str,
            moved_to: impl Fn(&T, &str),
        ) {
            let moved: Vec<String> = map
                .keys()
                .filter(|path| path.starts_with(old_prefix))
                .cloned()
                .collect();
            for path in moved {
                if let Some(entry) = map.remove(&path) {
                    let to = join(new_path, &path[old_prefix.len()..]);
                    moved_to(&entry, &to);
                    map.insert(to, entry);
                }
            }
        }

        let old_prefix = if old_path == ROOT {
            ROOT.to_owned()
        } else {
            format!("{old_path}/")
        };
        let mut directories = self.directories.write();
        let mut map = self.metadata.write();
        repath(&mut directories, &old_prefix, new_path, |_, _| {});
        repath(&mut map, &old_prefix, new_path, Metadata::set_path);
    }

    /// Opens the root directory, creating and flushing an empty one if the backend has none.
    #[instrument(name = "CacheStore::ensure_root", skip(self))]
    pub fn ensure_root(self: &Arc<Self>, owner: u32, group: u32, permissions: u32) -> Result<()> {
        match self.open_directory::<Unlocked>(ROOT) {
            Ok(root) => root.close(),
            Err(Error::FileDoesNotExist { .. }) => {
                info!(owner, group, "backend has no root directory, creating one");
                let mode = MODE_DIRECTORY | (permissions & !MODE_TYPE_MASK);
                let root = self.create_directory::<Unlocked>(ROOT, owner, group, mode)?;
                root.flush()?;
                root.close()
            }
            Err(e) => Err(e),
        }
    }

    /// Type of the object at `path`.
    pub fn get_type(self: &Arc<Self>, path: &str) -> Result<FileKind> {
        let cached = self.metadata.read().get(path).map(Arc::clone);
        match cached {
            Some(metadata) => Ok(metadata.inode().kind()),
            None => self.indexing.get_type(self, path),
        }
    }

    /// Snapshot of cached directories, or `None` if the map lock is contended and
    /// `blocking` is off.
    pub(crate) fn directory_snapshot(&self, blocking: bool) -> Option<Vec<(String, Arc<Directory>)>> {
        let map = if blocking {
            self.directories.read()
        } else {
            self.directories.try_read()?
        };
        Some(snapshot(&map))
    }

    /// Snapshot of cached metadata, or `None` if the map lock is contended and `blocking` is off.
    pub(crate) fn metadata_snapshot(&self, blocking: bool) -> Option<Vec<(String, Arc<Metadata>)>> {
        let map = if blocking {
            self.metadata.read()
        } else {
            self.metadata.try_read()?
        };
        Some(snapshot(&map))
    }

    /// Synchronously flushes every cached object, directories first.
    ///
    /// Keeps going past failures and returns the first one.
    #[instrument(name = "CacheStore::flush_all", skip(self))]
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for (path, directory) in self.directory_snapshot(true).unwrap_or_default() {
            if let Err(e) = directory.flush() {
                warn!(path, error = %e, "failed to flush directory");
                first_error.get_or_insert(e);
            }
        }
        for (path, metadata) in self.metadata_snapshot(true).unwrap_or_default() {
            if let Err(e) = metadata.flush() {
                warn!(path, error = %e, "failed to flush metadata");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Evicts every closed entry the policy no longer wants to keep.
    ///
    /// Without `blocking`, a contended map is skipped and `false` is returned.
    pub(crate) fn evict_expired(&self, blocking: bool) -> Result<bool> {
        let Some(directories) = self.directory_snapshot(blocking) else {
            return Ok(false);
        };
        for (_, directory) in directories {
            if directory.metadata().open_count() == 0 {
                self.drop_directory_if_unused(&directory)?;
            }
        }
        let Some(entries) = self.metadata_snapshot(blocking) else {
            return Ok(false);
        };
        for (_, metadata) in entries {
            if metadata.open_count() == 0 {
                self.drop_if_unused(&metadata)?;
            }
        }
        Ok(true)
    }
}

fn snapshot<T>(map: &RwLockReadGuard<'_, FxHashMap<String, Arc<T>>>) -> Vec<(String, Arc<T>)> {
    map.iter()
        .map(|(path, entry)| (path.clone(), Arc::clone(entry)))
        .collect()
}
