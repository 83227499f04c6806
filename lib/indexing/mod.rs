//! Mapping paths to backend keys.
//!
//! An [`IndexingScheme`] decides which key an object's attributes (and, through
//! [`StripeKey`](crate::node::stripe::StripeKey), its data) are stored under. The cache store
//! holds one as a trait object, chosen when the mount is configured.

mod full_path;
mod indirect;

pub use full_path::FullPathIndexing;
pub use indirect::IndirectIndexing;

use std::borrow::Cow;
use std::sync::Arc;

use crate::cache::{CacheStore, Shared};
use crate::error::{Error, Result};
use crate::node::{DirectoryEntry, FileKind, Inode};

/// Path of the mount's root directory.
pub const ROOT: &str = "/";

/// Strategy for deriving backend keys.
pub trait IndexingScheme: Send + Sync + std::fmt::Debug {
    /// Short name for logs and configuration.
    fn name(&self) -> &'static str;

    /// Length of the identifier stored in each directory entry.
    fn identifier_len(&self) -> usize;

    /// Whether renaming changes an object's key, forcing its data to move.
    fn relocates_on_rename(&self) -> bool;

    /// Key of an existing directory.
    fn existing_directory_key(&self, store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>>;

    /// Key of an existing object of any kind.
    fn existing_regular_file_key(&self, store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>>;

    /// Allocates the key of a directory about to exist at `path`.
    ///
    /// Records any identifier the scheme needs in `inode`.
    fn new_directory_key(&self, path: &str, inode: &mut Inode) -> Result<Vec<u8>>;

    /// Allocates the key of a regular file about to exist at `path`.
    ///
    /// Records any identifier the scheme needs in `inode`.
    fn new_regular_file_key(&self, path: &str, inode: &mut Inode) -> Result<Vec<u8>>;

    /// Type of the object at `path`, read from its parent's entry.
    fn get_type(&self, store: &Arc<CacheStore>, path: &str) -> Result<FileKind> {
        if path == ROOT {
            return Ok(FileKind::Directory);
        }
        let parent = store.open_directory::<Shared>(parent_of(path))?;
        parent
            .get_entry(file_name(path))
            .map(DirectoryEntry::kind)
            .map_err(|_| Error::FileDoesNotExist {
                path: path.to_owned(),
            })
    }
}

/// Canonical form of an absolute path: no empty, trailing, `.` or `..` components.
///
/// Cache entries and full-path keys are keyed by this form, so every path from outside the
/// crate goes through here first.
pub fn normalize(path: &str) -> Result<Cow<'_, str>> {
    let invalid = || Error::InvalidPath {
        path: path.to_owned(),
    };
    if !path.starts_with('/') {
        return Err(invalid());
    }
    let mut normal = String::with_capacity(path.len());
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(invalid());
        }
        normal.push('/');
        normal.push_str(component);
    }
    if normal.is_empty() {
        normal.push_str(ROOT);
    }
    Ok(if normal == path {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(normal)
    })
}

/// The directory containing `path`. The root is its own parent.
#[must_use]
pub fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => ROOT,
        Some(i) => &path[..i],
    }
}

/// The last component of `path`, empty for the root.
#[must_use]
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rfind('/').map_or(trimmed, |i| &trimmed[i + 1..])
}

/// `parent` joined with `name`.
#[must_use]
pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
