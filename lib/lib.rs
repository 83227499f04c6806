//! A POSIX-style filesystem layered over a flat key-value store.
//!
//! Paths map to backend keys through an [`indexing::IndexingScheme`]. File data is split into
//! fixed-size stripes stored under derived keys, directories are serialized entry lists, and a
//! [`cache::CacheStore`] keeps open objects in memory with write-back on close and on a timer.

/// Key-value backends the filesystem is stored in.
pub mod backend;
/// Caching of open objects.
pub mod cache;
pub mod error;
/// Request-facing filesystem operations.
pub mod fs;
/// Path to key mapping.
pub mod indexing;
pub mod node;

pub use error::{Error, Result};
