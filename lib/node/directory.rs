//! Directory inodes.
//!
//! A directory's entry set is serialized as the data of its own inode:
//!
//! ```text
//! entry_count:u32 { name_len:u32 name:[u8] identifier:[u8; N] kind:u32 }*
//! ```
//!
//! `N` is fixed per indexing scheme (zero when keys derive from paths). `kind` holds the mode type
//! bits of the child, which lets type lookups stop at the parent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use parking_lot::{
    ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, warn};

use super::metadata::{Inode, Metadata};
use super::FileKind;
use crate::backend::printable_key;
use crate::error::{Error, Result};
use crate::indexing::file_name;

/// One name in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    name: String,
    kind: FileKind,
    identifier: Vec<u8>,
}

impl DirectoryEntry {
    /// Builds an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FileKind, identifier: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            identifier,
        }
    }

    /// The child's name within the directory.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The child's type.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Indexing-scheme identifier of the child.
    #[must_use]
    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    fn encoded_len(&self) -> u64 {
        (4 + self.name.len() + self.identifier.len() + 4) as u64
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// The lock-protected entry set of one directory.
#[derive(Debug)]
pub struct DirectoryContent {
    entries: BTreeMap<String, DirectoryEntry>,
    encoded_len: u64,
    identifier_len: usize,
    dirty: Arc<AtomicBool>,
}

impl DirectoryContent {
    fn empty(identifier_len: usize, dirty: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            encoded_len: 4,
            identifier_len,
            dirty: Arc::new(AtomicBool::new(dirty)),
        }
    }

    fn decode(on_disk: &[u8], identifier_len: usize, key: &[u8]) -> Result<Self> {
        let corrupted = || Error::Corrupted {
            key: printable_key(key),
        };
        let mut content = Self::empty(identifier_len, false);
        let mut buf = on_disk;
        if buf.remaining() < 4 {
            return Err(corrupted());
        }
        let count = buf.get_u32_le();
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(corrupted());
            }
            let name_len = buf.get_u32_le() as usize;
            if buf.remaining() < name_len + identifier_len + 4 {
                return Err(corrupted());
            }
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|_| corrupted())?
                .to_owned();
            buf.advance(name_len);
            let identifier = buf[..identifier_len].to_vec();
            buf.advance(identifier_len);
            let kind = FileKind::from_mode(buf.get_u32_le()).map_err(|_| corrupted())?;
            content.insert(DirectoryEntry {
                name,
                kind,
                identifier,
            });
        }
        Ok(content)
    }

    /// Serializes the entry set.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(usize::try_from(self.encoded_len).unwrap_or(0));
        buf.put_u32_le(len_u32(self.entries.len()));
        for entry in self.entries.values() {
            buf.put_u32_le(len_u32(entry.name.len()));
            buf.put_slice(entry.name.as_bytes());
            buf.put_slice(&entry.identifier);
            buf.put_u32_le(entry.kind.mode_bits());
        }
        buf.freeze()
    }

    /// Size in bytes of [`DirectoryContent::encode`]'s output.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        self.encoded_len
    }

    /// Whether entry changes await a flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn insert(&mut self, entry: DirectoryEntry) -> bool {
        if self.entries.contains_key(&entry.name) {
            return false;
        }
        self.encoded_len += entry.encoded_len();
        self.entries.insert(entry.name.clone(), entry);
        true
    }

    fn take(&mut self, name: &str) -> Option<DirectoryEntry> {
        let entry = self.entries.remove(name)?;
        self.encoded_len -= entry.encoded_len();
        Some(entry)
    }

    /// Adds `child` under `name`.
    ///
    /// A duplicate name is left untouched; callers are expected to have checked uniqueness.
    pub fn add_file(&mut self, name: &str, child: &Inode) {
        if child.identifier().len() != self.identifier_len {
            warn!(
                name,
                expected = self.identifier_len,
                got = child.identifier().len(),
                "child identifier has unexpected length"
            );
        }
        let entry = DirectoryEntry::new(name, child.kind(), child.identifier().to_vec());
        if self.insert(entry) {
            self.dirty.store(true, Ordering::Release);
        } else {
            warn!(name, "entry already exists, not adding");
        }
    }

    /// Drops the entry called `name`.
    pub fn remove_file(&mut self, name: &str) {
        if self.take(name).is_some() {
            self.dirty.store(true, Ordering::Release);
        } else {
            warn!(name, "removing an entry that does not exist");
        }
    }

    /// Looks up the entry called `name`.
    pub fn get_entry(&self, name: &str) -> Result<&DirectoryEntry> {
        self.entries.get(name).ok_or_else(|| Error::FileDoesNotExist {
            path: name.to_owned(),
        })
    }

    /// Moves the entry for `old_path`'s file name to `new_path`'s file name.
    ///
    /// The entry lands in `target`, or back in this directory when `target` is `None`. An entry
    /// already at the destination name is replaced.
    pub fn move_entry(
        &mut self,
        old_path: &str,
        new_path: &str,
        target: Option<&mut Self>,
    ) -> Result<()> {
        let mut entry = self
            .take(file_name(old_path))
            .ok_or_else(|| Error::FileDoesNotExist {
                path: old_path.to_owned(),
            })?;
        self.dirty.store(true, Ordering::Release);
        entry.name = file_name(new_path).to_owned();

        let target = target.unwrap_or(self);
        if target.take(&entry.name).is_some() {
            debug!(name = %entry.name, "replacing existing entry");
        }
        target.insert(entry);
        target.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Calls `lister` for every entry, in name order.
    pub fn fill_buffer(&self, mut lister: impl FnMut(&DirectoryEntry)) {
        for entry in self.entries.values() {
            lister(entry);
        }
    }

    /// Iterates the entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.values()
    }

    /// Number of entries.
    #[must_use]
    pub fn number_of_files(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the entry set into the directory's inode, then flushes the inode.
    pub fn flush_into(&self, inode: &mut Inode) -> Result<()> {
        if !inode.is_valid() {
            return Ok(());
        }
        if self.dirty.load(Ordering::Acquire) {
            let bytes = self.encode();
            let len = bytes.len() as u64;
            if len < inode.size() {
                inode.truncate(len)?;
            }
            inode.write(&bytes, 0)?;
            inode.flush()?;
            self.dirty.store(false, Ordering::Release);
        } else {
            inode.flush()?;
        }
        Ok(())
    }
}

fn read_content(path: &str, inode: &Inode, identifier_len: usize) -> Result<DirectoryContent> {
    if inode.kind() != FileKind::Directory {
        return Err(Error::IsNotDirectory {
            path: path.to_owned(),
        });
    }
    if inode.size() == 0 {
        return Ok(DirectoryContent::empty(identifier_len, true));
    }
    let len = usize::try_from(inode.size()).map_err(|_| Error::Corrupted {
        key: printable_key(inode.key()),
    })?;
    let mut buf = vec![0u8; len];
    let read = inode.read(&mut buf, 0)?;
    DirectoryContent::decode(&buf[..read], identifier_len, inode.key())
}

/// A cached directory: its [`Metadata`] handle plus the parsed entry set.
#[derive(Debug)]
pub struct Directory {
    metadata: Arc<Metadata>,
    content: Arc<RwLock<DirectoryContent>>,
    dirty: Arc<AtomicBool>,
}

impl Directory {
    /// Parses the entry set stored in `metadata`'s data.
    ///
    /// A directory that has never been flushed starts empty and dirty.
    pub fn construct(path: &str, metadata: Arc<Metadata>, identifier_len: usize) -> Result<Self> {
        let content = read_content(path, &metadata.inode(), identifier_len)?;
        debug!(path, entries = content.number_of_files(), "loaded directory");
        Ok(Self {
            metadata,
            dirty: Arc::clone(&content.dirty),
            content: Arc::new(RwLock::new(content)),
        })
    }

    /// Re-reads attributes and entries from the backend.
    ///
    /// Pending local changes are flushed first.
    pub fn reload(&self, path: &str) -> Result<()> {
        let mut content = self.content.write();
        let mut inode = self.metadata.inode_mut();
        content.flush_into(&mut inode)?;
        inode.reload()?;
        let identifier_len = content.identifier_len;
        let mut fresh = read_content(path, &inode, identifier_len)?;
        self.dirty.store(fresh.is_dirty(), Ordering::Release);
        fresh.dirty = Arc::clone(&self.dirty);
        *content = fresh;
        debug!(path, entries = content.number_of_files(), "reloaded directory");
        Ok(())
    }

    /// The directory's own inode.
    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    /// Shared access to the entry set.
    pub fn content(&self) -> RwLockReadGuard<'_, DirectoryContent> {
        self.content.read()
    }

    /// Exclusive access to the entry set.
    pub fn content_mut(&self) -> RwLockWriteGuard<'_, DirectoryContent> {
        self.content.write()
    }

    pub(crate) fn shared_arc(&self) -> ArcRwLockReadGuard<RawRwLock, DirectoryContent> {
        self.content.read_arc()
    }

    pub(crate) fn exclusive_arc(&self) -> ArcRwLockWriteGuard<RawRwLock, DirectoryContent> {
        self.content.write_arc()
    }

    /// Number of entries, under the shared lock.
    #[must_use]
    pub fn number_of_files(&self) -> usize {
        self.content.read().number_of_files()
    }

    /// Whether the directory has no entries, under the shared lock.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.read().is_empty()
    }

    /// Whether entries or attributes await a flush. Never waits for a lock.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire) || self.metadata.is_dirty()
    }

    /// Persists entries and attributes.
    pub fn flush(&self) -> Result<()> {
        let content = self.content.read();
        content.flush_into(&mut self.metadata.inode_mut())
    }

    /// Like [`Directory::flush`], but gives up instead of waiting on a lock.
    pub fn try_flush(&self) -> Option<Result<()>> {
        let content = self.content.try_read()?;
        let mut inode = self.metadata.try_inode_mut()?;
        Some(content.flush_into(&mut inode))
    }

    /// Deletes the directory's inode from the backend.
    ///
    /// `content` is this directory's entry set, borrowed from a lock the caller already holds.
    pub fn remove(&self, content: &DirectoryContent) -> Result<()> {
        content.dirty.store(false, Ordering::Release);
        self.metadata.remove()
    }
}
