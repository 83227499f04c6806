//! Inode attributes and striped file data.
//!
//! A [`Metadata`] is the single live cache entry for one object. Its attributes sit behind a
//! reader/writer lock as an [`Inode`]; every open context for the object shares that lock. The
//! attributes are persisted under the object's own key in a fixed little-endian layout:
//!
//! ```text
//! link_count:u32 owner:u32 group:u32 mode:u32 size:u64
//! atime:{sec:i64 nsec:i64} mtime:{..} ctime:{..} identifier:[u8]
//! ```
//!
//! The trailing identifier is only present under indirected indexing. File data lives in separate
//! stripe objects keyed by [`StripeKey`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use parking_lot::{
    ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use tracing::{debug, trace, warn};

use super::stripe::{STRIPE_COUNT_LIMIT, StripeKey};
use super::{FileKind, MODE_TYPE_MASK, Permissions, Volume};
use crate::backend::{BackendError, printable_key};
use crate::error::{Error, Result};

/// Size of the fixed part of the on-disk layout.
pub const ON_DISK_LEN: usize = 4 * 4 + 8 + 3 * 16;

/// Point-in-time copy of an object's attributes, as returned by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Regular file or directory.
    pub kind: FileKind,
    /// Permission bits.
    pub permissions: Permissions,
    /// Full mode, type bits included.
    pub mode: u32,
    /// Logical size in bytes.
    pub size: u64,
    /// Number of hard links.
    pub link_count: u32,
    /// Owning user id.
    pub owner: u32,
    /// Owning group id.
    pub group: u32,
    /// Last access.
    pub atime: SystemTime,
    /// Last content modification.
    pub mtime: SystemTime,
    /// Last attribute change.
    pub ctime: SystemTime,
}

/// Index of the last stripe a file of `size` bytes can occupy. Stripe 0 for an empty file.
fn last_stripe(size: u64, stripe: u64) -> u64 {
    size.saturating_sub(1) / stripe
}

fn to_timespec(t: SystemTime) -> (i64, i64) {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (
            i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            i64::from(d.subsec_nanos()),
        ),
        Err(e) => {
            let d = e.duration();
            let secs = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
            match i64::from(d.subsec_nanos()) {
                0 => (-secs, 0),
                nanos => (-secs - 1, 1_000_000_000 - nanos),
            }
        }
    }
}

fn from_timespec(secs: i64, nanos: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nanos.clamp(0, 999_999_999).unsigned_abs());
    let whole = Duration::from_secs(secs.unsigned_abs());
    let base = if secs >= 0 {
        UNIX_EPOCH.checked_add(whole)
    } else {
        UNIX_EPOCH.checked_sub(whole)
    };
    base.and_then(|t| t.checked_add(nanos)).unwrap_or(UNIX_EPOCH)
}

/// The lock-protected state of one object.
#[derive(Debug)]
pub struct Inode {
    volume: Arc<Volume>,
    key: Vec<u8>,
    identifier: Vec<u8>,
    link_count: u32,
    owner: u32,
    group: u32,
    mode: u32,
    size: u64,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    /// Flush only needs the shared lock, so the flag is atomic. It is shared with the owning
    /// [`Metadata`] so eviction can check it without the inode lock.
    dirty: Arc<AtomicBool>,
    valid: bool,
}

impl Inode {
    /// Fresh attributes for an object about to be created.
    ///
    /// The key is empty until the indexing scheme assigns one with [`Inode::set_key`].
    pub fn create(volume: Arc<Volume>, owner: u32, group: u32, mode: u32) -> Result<Self> {
        let kind = FileKind::from_mode(mode)?;
        let now = SystemTime::now();
        Ok(Self {
            volume,
            key: Vec::new(),
            identifier: Vec::new(),
            link_count: match kind {
                FileKind::Regular => 1,
                FileKind::Directory => 2,
            },
            owner,
            group,
            mode,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            dirty: Arc::new(AtomicBool::new(true)),
            valid: true,
        })
    }

    /// Parses attributes fetched from the backend under `key`.
    pub fn load(volume: Arc<Volume>, key: Vec<u8>, on_disk: &[u8]) -> Result<Self> {
        let mut inode = Self {
            volume,
            key,
            identifier: Vec::new(),
            link_count: 0,
            owner: 0,
            group: 0,
            mode: 0,
            size: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            dirty: Arc::new(AtomicBool::new(false)),
            valid: true,
        };
        inode.decode(on_disk)?;
        Ok(inode)
    }

    fn corrupted(&self) -> Error {
        Error::Corrupted {
            key: printable_key(&self.key),
        }
    }

    fn decode(&mut self, on_disk: &[u8]) -> Result<()> {
        if on_disk.len() < ON_DISK_LEN {
            return Err(self.corrupted());
        }
        let mut buf = on_disk;
        let link_count = buf.get_u32_le();
        let owner = buf.get_u32_le();
        let group = buf.get_u32_le();
        let mode = buf.get_u32_le();
        if FileKind::from_mode(mode).is_err() {
            return Err(self.corrupted());
        }
        let size = buf.get_u64_le();
        let mut times = [UNIX_EPOCH; 3];
        for t in &mut times {
            let secs = buf.get_i64_le();
            let nanos = buf.get_i64_le();
            *t = from_timespec(secs, nanos);
        }
        let [atime, mtime, ctime] = times;

        self.link_count = link_count;
        self.owner = owner;
        self.group = group;
        self.mode = mode;
        self.size = size;
        self.atime = atime;
        self.mtime = mtime;
        self.ctime = ctime;
        self.identifier = buf.to_vec();
        Ok(())
    }

    /// Serializes the attributes into their on-disk layout.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ON_DISK_LEN + self.identifier.len());
        buf.put_u32_le(self.link_count);
        buf.put_u32_le(self.owner);
        buf.put_u32_le(self.group);
        buf.put_u32_le(self.mode);
        buf.put_u64_le(self.size);
        for t in [self.atime, self.mtime, self.ctime] {
            let (secs, nanos) = to_timespec(t);
            buf.put_i64_le(secs);
            buf.put_i64_le(nanos);
        }
        buf.put_slice(&self.identifier);
        buf.freeze()
    }

    /// Backend key the attributes are stored under. Stripes hang off the same key.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Assigns the backend key of an object that has not been persisted yet.
    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = key;
    }

    /// Indexing-scheme identifier, empty when the scheme derives keys from paths.
    #[must_use]
    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    /// Records the indexing-scheme identifier.
    pub fn set_identifier(&mut self, identifier: Vec<u8>) {
        self.identifier = identifier;
        self.mark_dirty();
    }

    /// Regular file or directory.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        match self.mode & MODE_TYPE_MASK {
            super::MODE_DIRECTORY => FileKind::Directory,
            _ => FileKind::Regular,
        }
    }

    /// Full mode, type bits included.
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether attribute or content changes await a flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// False once the object has been removed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Snapshot for `getattr`.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        Attributes {
            kind: self.kind(),
            permissions: Permissions::from_mode(self.mode),
            mode: self.mode,
            size: self.size,
            link_count: self.link_count,
            owner: self.owner,
            group: self.group,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.mode = (self.mode & MODE_TYPE_MASK) | permissions.bits();
        self.ctime = SystemTime::now();
        self.mark_dirty();
    }

    /// Changes owner and/or group.
    pub fn set_owner(&mut self, owner: Option<u32>, group: Option<u32>) {
        if let Some(owner) = owner {
            self.owner = owner;
        }
        if let Some(group) = group {
            self.group = group;
        }
        self.ctime = SystemTime::now();
        self.mark_dirty();
    }

    /// Sets access and/or modification time.
    pub fn set_times(&mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        if let Some(atime) = atime {
            self.atime = atime;
        }
        if let Some(mtime) = mtime {
            self.mtime = mtime;
        }
        self.ctime = SystemTime::now();
        self.mark_dirty();
    }

    /// Largest size a file may reach before the stripe index overflows.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.volume.stripe_size().saturating_mul(STRIPE_COUNT_LIMIT)
    }

    fn stripe_index(&self, offset: u64) -> Result<u32> {
        let index = offset / self.volume.stripe_size();
        if index >= STRIPE_COUNT_LIMIT {
            return Err(Error::FileTooLarge { offset });
        }
        u32::try_from(index).map_err(|_| Error::FileTooLarge { offset })
    }

    /// Writes `data` at `offset`, one backend put per stripe touched.
    ///
    /// Returns `data.len()`; a backend failure part-way leaves the size unchanged.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.max_size())
            .ok_or(Error::FileTooLarge { offset })?;

        let stripe = self.volume.stripe_size();
        let backend = self.volume.backend();
        let mut key = StripeKey::new(&self.key, self.stripe_index(offset)?);
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let within = pos % stripe;
            let n = usize::try_from(stripe - within)
                .unwrap_or(usize::MAX)
                .min(data.len() - done);
            key.set_index(self.stripe_index(pos)?);
            trace!(key = %printable_key(key.as_bytes()), within, n, "writing stripe");
            backend.put_at(key.as_bytes(), within, &data[done..done + n])?;
            done += n;
        }

        if end > self.size {
            self.size = end;
        }
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
        self.mark_dirty();
        Ok(data.len())
    }

    /// Reads into `buf` from `offset`, clamped to the file size.
    ///
    /// Stripes the backend does not have read back as zeroes.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = usize::try_from(self.size - offset)
            .unwrap_or(usize::MAX)
            .min(buf.len());
        let buf = &mut buf[..len];

        let stripe = self.volume.stripe_size();
        let backend = self.volume.backend();
        let mut key = StripeKey::new(&self.key, self.stripe_index(offset)?);
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let within = pos % stripe;
            let n = usize::try_from(stripe - within)
                .unwrap_or(usize::MAX)
                .min(len - done);
            key.set_index(self.stripe_index(pos)?);
            let chunk = &mut buf[done..done + n];
            match backend.get_range(key.as_bytes(), within, chunk) {
                Ok(got) => chunk[got..].fill(0),
                Err(BackendError::KeyDoesNotExist { .. }) => chunk.fill(0),
                Err(e) => return Err(e.into()),
            }
            done += n;
        }
        Ok(len)
    }

    /// Deletes the stripe at `index`, tolerating holes.
    fn remove_stripe(&self, key: &mut StripeKey, index: u32) -> Result<()> {
        key.set_index(index);
        match self.volume.backend().remove(key.as_bytes()) {
            Ok(()) | Err(BackendError::KeyDoesNotExist { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Grows or shrinks the file.
    ///
    /// Growing leaves a hole. Shrinking deletes stripes wholly past the new end and zeroes the
    /// dropped tail of the last kept stripe, so a later grow reads zeroes there.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        if new_size > self.max_size() {
            return Err(Error::FileTooLarge { offset: new_size });
        }
        if new_size < self.size {
            let stripe = self.volume.stripe_size();
            let mut key = StripeKey::new(&self.key, 0);

            let within = new_size % stripe;
            if within != 0 {
                let stripe_start = new_size - within;
                let tail_end = stripe.min(self.size - stripe_start);
                let zeroes = vec![0u8; usize::try_from(tail_end - within).unwrap_or(0)];
                key.set_index(self.stripe_index(new_size)?);
                self.volume
                    .backend()
                    .put_at(key.as_bytes(), within, &zeroes)?;
            }

            let first_dropped = new_size.div_ceil(stripe);
            for index in first_dropped..=last_stripe(self.size, stripe) {
                self.remove_stripe(&mut key, self.stripe_index(index * stripe)?)?;
            }
        }

        self.size = new_size;
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
        self.mark_dirty();
        Ok(())
    }

    /// Persists the attributes if they changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        if !self.valid || !self.is_dirty() {
            return Ok(());
        }
        self.volume.backend().put(&self.key, &self.encode())?;
        self.dirty.store(false, Ordering::Release);
        debug!(key = %printable_key(&self.key), "flushed attributes");
        Ok(())
    }

    /// Discards the cached attributes and re-fetches them.
    ///
    /// Local changes not yet flushed are written out first so that they are not lost.
    pub fn reload(&mut self) -> Result<()> {
        self.flush()?;
        let on_disk = self.volume.backend().get(&self.key)?;
        self.decode(&on_disk)?;
        self.dirty.store(false, Ordering::Release);
        self.valid = true;
        debug!(key = %printable_key(&self.key), "reloaded attributes");
        Ok(())
    }

    /// Copies every stripe to `new_base` and deletes the originals.
    pub fn move_data(&mut self, new_base: &[u8]) -> Result<()> {
        if new_base == self.key.as_slice() || self.size == 0 {
            return Ok(());
        }
        let backend = self.volume.backend();
        let last = self.stripe_index(self.size - 1)?;
        let mut from = StripeKey::new(&self.key, 0);
        let mut to = StripeKey::new(new_base, 0);
        for index in 0..=last {
            from.set_index(index);
            to.set_index(index);
            let data = match backend.get(from.as_bytes()) {
                Ok(data) => data,
                Err(BackendError::KeyDoesNotExist { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            backend.put(to.as_bytes(), &data)?;
            self.remove_stripe(&mut from, index)?;
        }
        debug!(
            from = %printable_key(&self.key),
            to = %printable_key(new_base),
            stripes = u64::from(last) + 1,
            "relocated data"
        );
        Ok(())
    }

    /// Moves the whole object, attributes and data, under `new_key`.
    ///
    /// The new copy is persisted before the old key is deleted; a crash in between leaves both.
    pub fn relocate(&mut self, new_key: Vec<u8>) -> Result<()> {
        if new_key == self.key {
            return Ok(());
        }
        self.move_data(&new_key)?;
        let old_key = std::mem::replace(&mut self.key, new_key);
        self.ctime = SystemTime::now();
        self.mark_dirty();
        self.flush()?;
        match self.volume.backend().remove(&old_key) {
            Ok(()) | Err(BackendError::KeyDoesNotExist { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the data stripes and the attributes object.
    ///
    /// The inode is invalid afterwards and is never flushed again.
    pub fn remove(&mut self) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        let stripe = self.volume.stripe_size();
        let mut key = StripeKey::new(&self.key, 0);
        for index in 0..=last_stripe(self.size, stripe) {
            self.remove_stripe(&mut key, self.stripe_index(index * stripe)?)?;
        }
        match self.volume.backend().remove(&self.key) {
            Ok(()) | Err(BackendError::KeyDoesNotExist { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.valid = false;
        self.dirty.store(false, Ordering::Release);
        debug!(key = %printable_key(&self.key), "removed object");
        Ok(())
    }
}

/// The cache entry for one object: its lock-protected [`Inode`] plus open bookkeeping.
#[derive(Debug)]
pub struct Metadata {
    inode: Arc<RwLock<Inode>>,
    dirty: Arc<AtomicBool>,
    path: Mutex<String>,
    open_count: AtomicUsize,
    last_close: Mutex<Instant>,
}

impl Metadata {
    /// Wraps `inode`, cached at `path`, as an entry opened once by its creator.
    #[must_use]
    pub fn new(path: &str, inode: Inode) -> Self {
        Self {
            dirty: Arc::clone(&inode.dirty),
            inode: Arc::new(RwLock::new(inode)),
            path: Mutex::new(path.to_owned()),
            open_count: AtomicUsize::new(1),
            last_close: Mutex::new(Instant::now()),
        }
    }

    /// The path this entry is cached under. Follows renames.
    #[must_use]
    pub fn path(&self) -> String {
        self.path.lock().clone()
    }

    /// Only called with the cache store's metadata map write-locked.
    pub(crate) fn set_path(&self, path: &str) {
        path.clone_into(&mut self.path.lock());
    }

    /// Number of logical opens not yet released.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) -> usize {
        self.open_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the count after decrementing.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .open_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or_else(|n| {
                warn!("open count underflow");
                n + 1
            });
        previous - 1
    }

    /// When the last open was released.
    #[must_use]
    pub fn last_close(&self) -> Instant {
        *self.last_close.lock()
    }

    pub(crate) fn stamp_close(&self) {
        *self.last_close.lock() = Instant::now();
    }

    pub(crate) fn shared_arc(&self) -> ArcRwLockReadGuard<RawRwLock, Inode> {
        self.inode.read_arc()
    }

    pub(crate) fn exclusive_arc(&self) -> ArcRwLockWriteGuard<RawRwLock, Inode> {
        self.inode.write_arc()
    }

    /// Shared access to the attributes.
    pub fn inode(&self) -> RwLockReadGuard<'_, Inode> {
        self.inode.read()
    }

    /// Exclusive access to the attributes.
    pub fn inode_mut(&self) -> RwLockWriteGuard<'_, Inode> {
        self.inode.write()
    }

    /// Exclusive access, unless someone else holds the lock.
    pub fn try_inode_mut(&self) -> Option<RwLockWriteGuard<'_, Inode>> {
        self.inode.try_write()
    }

    /// Snapshot of the attributes under the shared lock.
    #[must_use]
    pub fn attributes(&self) -> Attributes {
        self.inode.read().attributes()
    }

    /// See [`Inode::read`]. Takes the shared lock.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inode.read().read(buf, offset)
    }

    /// See [`Inode::write`]. Takes the exclusive lock.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.inode.write().write(data, offset)
    }

    /// See [`Inode::truncate`]. Takes the exclusive lock.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        self.inode.write().truncate(new_size)
    }

    /// See [`Inode::flush`]. Takes the shared lock.
    pub fn flush(&self) -> Result<()> {
        self.inode.read().flush()
    }

    /// Flushes unless someone holds the exclusive lock.
    ///
    /// Returns `None` when the lock was contended.
    pub fn try_flush(&self) -> Option<Result<()>> {
        self.inode.try_read().map(|inode| inode.flush())
    }

    /// Whether unflushed changes exist. Never waits for the inode lock.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// See [`Inode::reload`]. Takes the exclusive lock.
    pub fn reload(&self) -> Result<()> {
        self.inode.write().reload()
    }

    /// See [`Inode::move_data`]. Takes the exclusive lock.
    pub fn move_data(&self, new_base: &[u8]) -> Result<()> {
        self.inode.write().move_data(new_base)
    }

    /// See [`Inode::remove`]. Takes the exclusive lock.
    pub fn remove(&self) -> Result<()> {
        self.inode.write().remove()
    }
}
