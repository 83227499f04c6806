//! In-memory representations of the objects persisted in the backend.
/// Directory inodes and their entry sets.
pub mod directory;
/// Inode attributes and striped file data.
pub mod metadata;
/// Stripe key encoding.
pub mod stripe;

pub use directory::{Directory, DirectoryContent, DirectoryEntry};
pub use metadata::{Attributes, Inode, Metadata};

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::KvBackend;
use crate::error::{Error, Result};

/// Mask selecting the file type bits of a mode.
pub const MODE_TYPE_MASK: u32 = 0o170_000;
/// Mode type bits of a directory.
pub const MODE_DIRECTORY: u32 = 0o040_000;
/// Mode type bits of a regular file.
pub const MODE_REGULAR: u32 = 0o100_000;

/// Default size of one stripe object.
pub const DEFAULT_STRIPE_SIZE: u64 = 64 * 1024;

bitflags! {
    /// Permission bits of a mode, as in Unix `chmod`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;
    }
}

impl Permissions {
    /// Extracts the permission bits of `mode`, ignoring the type bits.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate(mode)
    }
}

/// The two kinds of object this filesystem stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
}

impl FileKind {
    /// Classifies the type bits of `mode`.
    pub fn from_mode(mode: u32) -> Result<Self> {
        match mode & MODE_TYPE_MASK {
            MODE_REGULAR => Ok(Self::Regular),
            MODE_DIRECTORY => Ok(Self::Directory),
            _ => Err(Error::TypeNotSupported { mode }),
        }
    }

    /// The mode type bits of this kind.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => MODE_REGULAR,
            Self::Directory => MODE_DIRECTORY,
        }
    }
}

/// Backend handle plus the data layout every object on a mount shares.
#[derive(Debug)]
pub struct Volume {
    backend: Arc<dyn KvBackend>,
    stripe_size: u64,
}

impl Volume {
    /// Binds `backend` with stripes of `stripe_size` bytes.
    ///
    /// # Panics
    ///
    /// If `stripe_size` is zero.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>, stripe_size: u64) -> Self {
        assert!(stripe_size > 0, "stripe size must be non-zero");
        Self {
            backend,
            stripe_size,
        }
    }

    /// The backend objects are persisted in.
    #[must_use]
    pub fn backend(&self) -> &dyn KvBackend {
        self.backend.as_ref()
    }

    /// Size of each stripe object in bytes.
    #[must_use]
    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }
}
