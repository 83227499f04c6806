use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use super::{IndexingScheme, ROOT, file_name, parent_of};
use crate::backend::printable_key;
use crate::cache::{CacheStore, Shared};
use crate::error::{Error, Result};
use crate::node::{FileKind, Inode};

/// Keys are random identifiers recorded in the parent directory's entry.
///
/// Every object except the root gets a version 4 UUID when it is created. Resolving a path costs a
/// lookup in the parent directory, but a rename only rewrites entries: no key changes and no data
/// moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndirectIndexing;

impl IndirectIndexing {
    fn key_of(identifier: &[u8]) -> Result<Vec<u8>> {
        let id = Uuid::from_slice(identifier).map_err(|_| Error::Corrupted {
            key: printable_key(identifier),
        })?;
        Ok(id.hyphenated().to_string().into_bytes())
    }

    fn resolve(store: &Arc<CacheStore>, path: &str) -> Result<(FileKind, Vec<u8>)> {
        let parent = store.open_directory::<Shared>(parent_of(path))?;
        let entry = parent
            .get_entry(file_name(path))
            .map_err(|_| Error::FileDoesNotExist {
                path: path.to_owned(),
            })?;
        let key = Self::key_of(entry.identifier())?;
        trace!(path, key = %printable_key(&key), "resolved through parent entry");
        Ok((entry.kind(), key))
    }

    fn allocate(inode: &mut Inode) -> Result<Vec<u8>> {
        if inode.identifier().is_empty() {
            inode.set_identifier(Uuid::new_v4().as_bytes().to_vec());
        }
        Self::key_of(inode.identifier())
    }
}

impl IndexingScheme for IndirectIndexing {
    fn name(&self) -> &'static str {
        "indirect"
    }

    fn identifier_len(&self) -> usize {
        16
    }

    fn relocates_on_rename(&self) -> bool {
        false
    }

    fn existing_directory_key(&self, store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>> {
        if path == ROOT {
            return Ok(ROOT.as_bytes().to_vec());
        }
        match Self::resolve(store, path)? {
            (FileKind::Directory, key) => Ok(key),
            (FileKind::Regular, _) => Err(Error::IsNotDirectory {
                path: path.to_owned(),
            }),
        }
    }

    fn existing_regular_file_key(&self, store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>> {
        if path == ROOT {
            return Ok(ROOT.as_bytes().to_vec());
        }
        Self::resolve(store, path).map(|(_, key)| key)
    }

    fn new_directory_key(&self, path: &str, inode: &mut Inode) -> Result<Vec<u8>> {
        if path == ROOT {
            return Ok(ROOT.as_bytes().to_vec());
        }
        Self::allocate(inode)
    }

    fn new_regular_file_key(&self, _path: &str, inode: &mut Inode) -> Result<Vec<u8>> {
        Self::allocate(inode)
    }
}
