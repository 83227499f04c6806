use std::sync::Arc;

use super::IndexingScheme;
use crate::cache::CacheStore;
use crate::error::Result;
use crate::node::Inode;

/// Keys are the path bytes themselves.
///
/// Lookups never touch the backend, but a rename changes every key under the renamed path, so all
/// of the affected objects and their stripes have to be copied.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullPathIndexing;

impl IndexingScheme for FullPathIndexing {
    fn name(&self) -> &'static str {
        "full-path"
    }

    fn identifier_len(&self) -> usize {
        0
    }

    fn relocates_on_rename(&self) -> bool {
        true
    }

    fn existing_directory_key(&self, _store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }

    fn existing_regular_file_key(&self, _store: &Arc<CacheStore>, path: &str) -> Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }

    fn new_directory_key(&self, path: &str, _inode: &mut Inode) -> Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }

    fn new_regular_file_key(&self, path: &str, _inode: &mut Inode) -> Result<Vec<u8>> {
        Ok(path.as_bytes().to_vec())
    }
}
