#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::time::Duration;

use common::{Scheme, mount, mount_on, mount_with, store};
use kvfs::Error;
use kvfs::cache::{EvictOnLastClose, Exclusive, HoldClosedCacheFor, Shared, Unlocked};
use kvfs::node::FileKind;

#[test]
fn open_then_close_leaves_open_count_unchanged() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let anchor = store.open::<Unlocked>("/a").unwrap();
    assert_eq!(anchor.metadata().open_count(), 1, "anchor is the only open");

    let second = store.open::<Shared>("/a").unwrap();
    assert!(
        std::sync::Arc::ptr_eq(anchor.metadata(), second.metadata()),
        "both opens share one cache entry"
    );
    assert_eq!(anchor.metadata().open_count(), 2);
    second.close().unwrap();

    assert_eq!(anchor.metadata().open_count(), 1, "close undoes exactly one open");
    assert!(store.is_cached("/a"), "still open, so still cached");
    anchor.close().unwrap();
    assert!(!store.is_cached("/a"), "evicted once the last open closes");
}

#[test]
fn dropping_a_context_releases_it() {
    let (_, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let anchor = store.open::<Unlocked>("/a").unwrap();
    {
        let _scoped = store.open::<Exclusive>("/a").unwrap();
        assert_eq!(anchor.metadata().open_count(), 2);
    }
    assert_eq!(anchor.metadata().open_count(), 1, "scope exit releases");
}

#[test]
fn hold_closed_policy_keeps_closed_entries() {
    let (_, fs) = mount_with(
        Scheme::Indirect,
        Box::new(HoldClosedCacheFor::new(Duration::from_secs(3600))),
    );
    fs.create("/a", 0o644).unwrap();

    let store = fs.store();
    assert!(store.is_cached("/a"), "closed entry is kept during the grace period");
    assert!(store.is_directory_cached("/"), "directories follow the same policy");

    let file = store.open::<Shared>("/a").unwrap();
    assert_eq!(file.metadata().open_count(), 1, "a kept entry starts again from zero opens");
}

#[test]
fn stale_entry_is_reloaded_from_backend() {
    let (backend, fs) = mount_with(
        Scheme::FullPath,
        Box::new(HoldClosedCacheFor::new(Duration::from_millis(50))),
    );
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let fresh = backend.gets();
    store.open::<Shared>("/a").unwrap().close().unwrap();
    assert_eq!(backend.gets(), fresh, "a fresh hit is served from memory");

    std::thread::sleep(Duration::from_millis(120));
    assert!(store.is_cached("/a"), "nothing evicts without a flusher");
    let file = store.open::<Shared>("/a").unwrap();
    assert_eq!(backend.gets(), fresh + 1, "a stale hit re-fetches the attributes");
    assert_eq!(file.attributes().kind, FileKind::Regular);
}

#[test]
fn create_rejects_cached_path_without_mutation() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let held = store.open::<Unlocked>("/a").unwrap();
    let puts = backend.puts();
    let err = store.create::<Unlocked>("/a", 0, 0, 0o100_644).unwrap_err();
    assert!(matches!(err, Error::FileAlreadyExists { .. }), "got {err:?}");
    assert_eq!(err.errno(), libc::EEXIST);
    assert_eq!(backend.puts(), puts, "failed create writes nothing");
    held.close().unwrap();
}

#[test]
fn create_rejects_key_already_in_backend() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();
    assert!(!store.is_cached("/a"));

    let puts = backend.puts();
    let err = store.create::<Unlocked>("/a", 0, 0, 0o100_644).unwrap_err();
    assert!(matches!(err, Error::FileAlreadyExists { .. }), "got {err:?}");
    assert_eq!(backend.puts(), puts);
    assert!(!store.is_cached("/a"), "failed create leaves nothing cached");
}

#[test]
fn create_rejects_unsupported_file_types() {
    let (_, store) = store(Scheme::Indirect);
    let err = store.create::<Unlocked>("/link", 0, 0, 0o120_777).unwrap_err();
    assert!(matches!(err, Error::TypeNotSupported { mode: 0o120_777 }), "got {err:?}");
    assert_eq!(err.errno(), libc::ENOTSUP);
}

#[test]
fn open_of_missing_path_is_file_does_not_exist() {
    for scheme in common::SCHEMES {
        let (_, store) = store(scheme);
        let err = store.open::<Shared>("/missing").unwrap_err();
        assert!(
            matches!(&err, Error::FileDoesNotExist { path } if path == "/missing"),
            "{scheme:?}: got {err:?}"
        );
        assert_eq!(store.cached_metadata_count(), 0, "{scheme:?}: misses are not cached");
    }
}

#[test]
fn get_type_reads_parent_entries() {
    for scheme in common::SCHEMES {
        let (_, fs) = mount(scheme);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();
        let store = fs.store();

        assert_eq!(store.get_type("/").unwrap(), FileKind::Directory);
        assert_eq!(store.get_type("/d").unwrap(), FileKind::Directory);
        assert_eq!(store.get_type("/d/f").unwrap(), FileKind::Regular);
        assert!(matches!(
            store.get_type("/d/g"),
            Err(Error::FileDoesNotExist { .. })
        ));
        assert_eq!(store.cached_metadata_count(), 0, "{scheme:?}: lookups leave nothing open");
    }
}

#[test]
fn eviction_flushes_dirty_entries() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let mut file = store.open::<Exclusive>("/a").unwrap();
    file.write(b"hello", 0).unwrap();
    assert!(file.is_dirty(), "size changed but attributes are not flushed yet");
    file.close().unwrap();
    assert!(!store.is_cached("/a"));
    drop(fs);

    let fs = mount_on(&backend, Scheme::FullPath, Box::new(EvictOnLastClose));
    assert_eq!(fs.getattr("/a").unwrap().size, 5, "size survived the eviction");
    assert_eq!(&fs.read("/a", 0, 16).unwrap()[..], b"hello");
}

#[test]
fn failed_eviction_flush_keeps_the_entry() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let mut file = store.open::<Exclusive>("/a").unwrap();
    file.set_owner(Some(7), None);
    backend.fail_puts(true);
    let err = file.close().unwrap_err();
    assert_eq!(err.errno(), libc::EIO, "the backend's code comes through");
    assert!(store.is_cached("/a"), "dirty state is not thrown away");

    backend.fail_puts(false);
    store.flush_all().unwrap();
    store.open::<Unlocked>("/a").unwrap().close().unwrap();
    assert!(!store.is_cached("/a"), "clean entry is evicted on the next close");
    assert_eq!(fs.getattr("/a").unwrap().owner, 7);
}

#[test]
fn flush_all_writes_open_dirty_entries() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let mut file = store.open::<Exclusive>("/a").unwrap();
    file.write(b"abc", 0).unwrap();
    let metadata = file.unlock_and_release();
    assert!(metadata.is_dirty());

    store.flush_all().unwrap();
    assert!(!metadata.is_dirty(), "flush_all flushes entries that are still open");
    store.close(&metadata).unwrap();
    assert!(!store.is_cached("/a"));
}

#[test]
fn remove_of_open_file_succeeds_and_forgets_it() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/a", 0o644).unwrap();
    fs.write("/a", 0, &common::pattern(40, 1)).unwrap();
    let store = fs.store();

    let held = store.open::<Unlocked>("/a").unwrap();
    fs.unlink("/a").unwrap();
    assert!(!store.is_cached("/a"), "removed entries leave the cache immediately");
    assert!(
        backend.keys_with_prefix(b"/a").is_empty(),
        "attributes and every stripe are gone"
    );

    held.close().unwrap();
    assert!(backend.keys_with_prefix(b"/a").is_empty(), "closing does not resurrect it");
}

#[test]
fn remove_refuses_directories() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.mkdir("/d", 0o755).unwrap();
    let store = fs.store();

    let dir = store.open::<Exclusive>("/d").unwrap();
    let err = store.remove(dir).unwrap_err();
    assert!(matches!(err, Error::IsDirectory { .. }), "got {err:?}");
    assert_eq!(fs.getattr("/d").unwrap().kind, FileKind::Directory);
}

#[test]
fn remove_directory_refuses_non_empty() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.mkdir("/d", 0o755).unwrap();
    fs.create("/d/f", 0o644).unwrap();
    let store = fs.store();

    let dir = store.open_directory::<Exclusive>("/d").unwrap();
    let err = store.remove_directory(dir).unwrap_err();
    assert!(matches!(err, Error::DirectoryNotEmpty { .. }), "got {err:?}");
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(!store.is_directory_cached("/d"), "the refused context was released");
    assert_eq!(fs.readdir("/d").unwrap().len(), 3);
}

#[test]
fn directory_and_metadata_share_one_instance() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.mkdir("/d", 0o755).unwrap();
    let store = fs.store();

    let dir = store.open_directory::<Unlocked>("/d").unwrap();
    let attrs = store.open::<Shared>("/d").unwrap();
    assert!(std::sync::Arc::ptr_eq(dir.directory().metadata(), attrs.metadata()));
    assert_eq!(attrs.metadata().open_count(), 2);
    drop(attrs);

    assert!(store.is_cached("/d"), "metadata stays while its directory is cached");
    dir.close().unwrap();
    assert!(!store.is_directory_cached("/d"));
    assert!(!store.is_cached("/d"), "directory eviction takes its metadata along");
}

#[test]
fn relock_fails_once_the_path_moved_on() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/a", 0o644).unwrap();
    let store = fs.store();

    let held = store.open::<Unlocked>("/a").unwrap();
    fs.unlink("/a").unwrap();
    let err = held.relock::<Exclusive>().unwrap_err();
    assert!(matches!(err, Error::FileDoesNotExist { .. }), "got {err:?}");
}

#[test]
fn context_held_across_a_move_closes_at_the_new_path() {
    for scheme in common::SCHEMES {
        let (_, store) = store(scheme);
        let file = store.create::<Unlocked>("/x", 0, 0, 0o100_644).unwrap();
        file.metadata().flush().unwrap();
        assert_eq!(file.path(), "/x");

        store.move_file("/x", "/y").unwrap();
        assert_eq!(file.metadata().path(), "/y", "{scheme:?}");
        assert!(store.is_cached("/y"));

        file.close().unwrap();
        assert!(!store.is_cached("/y"), "{scheme:?}: the moved entry is evicted");
        assert!(!store.is_cached("/x"));
    }
}

#[test]
fn ensure_root_is_idempotent() {
    let (backend, store) = store(Scheme::FullPath);
    let puts = backend.puts();
    store.ensure_root(0, 0, 0o700).unwrap();
    assert_eq!(backend.puts(), puts, "an existing root is left alone");

    let root = store.open_directory::<Shared>("/").unwrap();
    assert!(root.is_empty());
    assert_eq!(root.attributes().permissions.bits(), 0o755);
    assert_eq!(root.attributes().link_count, 2);
}
