#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{SCHEMES, Scheme, mount, mount_options, pattern};
use kvfs::Error;
use kvfs::backend::{DirBackend, KvBackend};
use kvfs::cache::{EvictOnLastClose, Shared};
use kvfs::fs::{KvFs, OpenFlags};
use kvfs::node::FileKind;

fn names(listing: &[(String, FileKind)]) -> Vec<&str> {
    listing.iter().map(|(name, _)| name.as_str()).collect()
}

#[test]
fn write_then_read_round_trips_across_stripes() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.create("/f", 0o644).unwrap();
        let data = pattern(100, 3);

        assert_eq!(fs.write("/f", 0, &data).unwrap(), 100);
        assert_eq!(fs.getattr("/f").unwrap().size, 100, "{scheme:?}");

        let back = fs.read("/f", 0, 200).unwrap();
        assert_eq!(&back[..], &data[..], "{scheme:?}: read is clamped to the file size");
        assert_eq!(&fs.read("/f", 30, 10).unwrap()[..], &data[30..40]);
        assert!(fs.read("/f", 100, 10).unwrap().is_empty(), "reading at EOF is empty");
    }
}

#[test]
fn readdir_lists_dot_entries_first() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();

        let listing = fs.readdir("/d").unwrap();
        assert_eq!(names(&listing), [".", "..", "f"], "{scheme:?}");
        assert_eq!(listing[2].1, FileKind::Regular);

        fs.mkdir("/d/b", 0o700).unwrap();
        let listing = fs.readdir("/d").unwrap();
        assert_eq!(names(&listing), [".", "..", "b", "f"], "entries come in name order");
        assert_eq!(listing[2].1, FileKind::Directory);
        assert_eq!(names(&fs.readdir("/").unwrap()), [".", "..", "d"]);
    }
}

#[test]
fn new_objects_carry_mount_owner_and_mode() {
    let (_, fs) = mount(Scheme::Indirect);
    let dir = fs.mkdir("/d", 0o750).unwrap();
    assert_eq!(dir.kind, FileKind::Directory);
    assert_eq!(dir.mode, 0o040_750);
    assert_eq!(dir.link_count, 2);
    assert_eq!((dir.owner, dir.group), (1000, 100));

    let file = fs.create("/d/f", 0o640).unwrap();
    assert_eq!(file.mode, 0o100_640);
    assert_eq!(file.size, 0);
    assert_eq!(file.link_count, 1);
    assert_eq!(fs.getattr("/d/f").unwrap().mode, 0o100_640, "attributes were persisted");
}

#[test]
fn truncate_shrink_then_grow_reads_zeroes() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.create("/f", 0o644).unwrap();
        fs.write("/f", 0, &[0xAA; 10]).unwrap();

        fs.truncate("/f", 4).unwrap();
        assert_eq!(fs.getattr("/f").unwrap().size, 4);
        fs.truncate("/f", 40).unwrap();
        assert_eq!(fs.getattr("/f").unwrap().size, 40);

        let back = fs.read("/f", 0, 40).unwrap();
        assert_eq!(&back[..4], &[0xAA; 4], "{scheme:?}: kept bytes survive");
        assert!(
            back[4..].iter().all(|b| *b == 0),
            "{scheme:?}: dropped tail and the new hole read as zeroes"
        );
    }
}

#[test]
fn truncate_drops_whole_stripes() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/f", 0o644).unwrap();
    fs.write("/f", 0, &pattern(64, 9)).unwrap();
    let stripes = |backend: &common::RecordingBackend| {
        backend
            .keys_with_prefix(b"/f")
            .into_iter()
            .filter(|k| k.len() > 2)
            .count()
    };
    assert_eq!(stripes(&*backend), 4);

    fs.truncate("/f", 20).unwrap();
    assert_eq!(stripes(&*backend), 2, "stripes wholly past the end are deleted");
    assert_eq!(&fs.read("/f", 0, 64).unwrap()[..], &pattern(64, 9)[..20]);
}

#[test]
fn sparse_write_leaves_a_hole() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.create("/f", 0o644).unwrap();
        fs.write("/f", 100, b"tail!").unwrap();

        assert_eq!(fs.getattr("/f").unwrap().size, 105);
        let back = fs.read("/f", 0, 105).unwrap();
        assert!(back[..100].iter().all(|b| *b == 0), "{scheme:?}: hole reads as zeroes");
        assert_eq!(&back[100..], b"tail!");
    }
}

#[test]
fn overwrite_in_the_middle_keeps_the_rest() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/f", 0o644).unwrap();
    let mut expected = pattern(50, 1);
    fs.write("/f", 0, &expected).unwrap();
    fs.write("/f", 14, b"XXXXXX").unwrap();
    expected[14..20].copy_from_slice(b"XXXXXX");

    assert_eq!(fs.getattr("/f").unwrap().size, 50, "an inner write does not grow the file");
    assert_eq!(&fs.read("/f", 0, 64).unwrap()[..], &expected[..]);
}

#[test]
fn unlink_and_rmdir_remove_entries() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();
        fs.write("/d/f", 0, b"bytes").unwrap();

        fs.unlink("/d/f").unwrap();
        assert!(matches!(fs.getattr("/d/f"), Err(Error::FileDoesNotExist { .. })));
        assert_eq!(names(&fs.readdir("/d").unwrap()), [".", ".."]);

        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.getattr("/d"), Err(Error::FileDoesNotExist { .. })));
        assert_eq!(names(&fs.readdir("/").unwrap()), [".", ".."], "{scheme:?}");
    }
}

#[test]
fn unlink_leaves_no_objects_behind() {
    let (backend, fs) = mount(Scheme::Indirect);
    let before = backend.inner().len();
    fs.create("/f", 0o644).unwrap();
    fs.write("/f", 0, &pattern(40, 2)).unwrap();
    assert!(backend.inner().len() > before);

    fs.unlink("/f").unwrap();
    assert_eq!(backend.inner().len(), before, "attributes and stripes were deleted");
}

#[test]
fn unlink_and_rmdir_reject_the_wrong_kind() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.mkdir("/d", 0o755).unwrap();
    fs.create("/f", 0o644).unwrap();

    let err = fs.unlink("/d").unwrap_err();
    assert!(matches!(err, Error::IsDirectory { .. }), "got {err:?}");
    assert_eq!(err.errno(), libc::EISDIR);

    let err = fs.rmdir("/f").unwrap_err();
    assert!(matches!(err, Error::IsNotDirectory { .. }), "got {err:?}");
    assert_eq!(err.errno(), libc::ENOTDIR);

    assert_eq!(fs.unlink("/").unwrap_err().errno(), libc::EBUSY);
    assert_eq!(fs.rmdir("/").unwrap_err().errno(), libc::EBUSY);
    assert_eq!(fs.unlink("/missing").unwrap_err().errno(), libc::ENOENT);
}

#[test]
fn rmdir_of_non_empty_directory_fails() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();

        let err = fs.rmdir("/d").unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY, "{scheme:?}: got {err:?}");
        assert_eq!(names(&fs.readdir("/d").unwrap()), [".", "..", "f"]);
        assert_eq!(names(&fs.readdir("/").unwrap()), [".", "..", "d"]);
    }
}

#[test]
fn create_rejects_bad_parents_and_duplicates() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.create("/f", 0o644).unwrap();

        let err = fs.mkdir("/missing/d", 0o755).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT, "{scheme:?}: got {err:?}");

        let err = fs.create("/f/x", 0o644).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTDIR, "{scheme:?}: got {err:?}");

        let err = fs.create("/f", 0o644).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST, "{scheme:?}: got {err:?}");
        let err = fs.mkdir("/f", 0o755).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST, "{scheme:?}: got {err:?}");
        assert_eq!(fs.mkdir("/", 0o755).unwrap_err().errno(), libc::EEXIST);
    }
}

#[test]
fn data_operations_reject_directories() {
    let (_, fs) = mount(Scheme::FullPath);
    fs.mkdir("/d", 0o755).unwrap();

    assert!(matches!(fs.write("/d", 0, b"x"), Err(Error::IsDirectory { .. })));
    assert!(matches!(fs.read("/d", 0, 1), Err(Error::IsDirectory { .. })));
    assert!(matches!(fs.truncate("/d", 0), Err(Error::IsDirectory { .. })));
    assert!(matches!(fs.readdir("/missing"), Err(Error::FileDoesNotExist { .. })));
}

#[test]
fn chmod_keeps_the_file_type() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);
        fs.create("/f", 0o644).unwrap();
        fs.mkdir("/d", 0o755).unwrap();

        let attributes = fs.chmod("/f", 0o600).unwrap();
        assert_eq!(attributes.mode, 0o100_600);
        assert_eq!(attributes.permissions.bits(), 0o600);
        assert_eq!(fs.getattr("/f").unwrap().mode, 0o100_600, "{scheme:?}: persisted");

        // Type bits in the argument are ignored.
        let attributes = fs.chmod("/d", 0o100_700).unwrap();
        assert_eq!(attributes.kind, FileKind::Directory);
        assert_eq!(attributes.mode, 0o040_700);
    }
}

#[test]
fn chown_and_utimens_change_only_what_is_given() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/f", 0o644).unwrap();

    let attributes = fs.chown("/f", Some(5), None).unwrap();
    assert_eq!((attributes.owner, attributes.group), (5, 100));
    let attributes = fs.chown("/f", None, Some(6)).unwrap();
    assert_eq!((attributes.owner, attributes.group), (5, 6));

    let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    let before = fs.getattr("/f").unwrap();
    fs.utimens("/f", None, Some(when)).unwrap();
    let after = fs.getattr("/f").unwrap();
    assert_eq!(after.mtime, when);
    assert_eq!(after.atime, before.atime, "atime was not given");
}

#[test]
fn open_handles_keep_objects_cached() {
    let (_, fs) = mount(Scheme::Indirect);
    fs.create("/f", 0o644).unwrap();
    assert!(!fs.store().is_cached("/f"));

    let a = fs.open("/f", OpenFlags::RDONLY).unwrap();
    let b = fs.open("/f", OpenFlags::RDWR).unwrap();
    assert_ne!(a, b, "handles are unique");
    assert_eq!(fs.open_handles(), 2);
    assert!(fs.store().is_cached("/f"));

    fs.write("/f", 0, b"abc").unwrap();
    fs.release(a).unwrap();
    assert!(fs.store().is_cached("/f"), "one handle is still open");
    fs.release(b).unwrap();
    assert!(!fs.store().is_cached("/f"));
    assert_eq!(fs.open_handles(), 0);

    fs.release(b).unwrap();
    assert_eq!(fs.getattr("/f").unwrap().size, 3);
}

#[test]
fn open_flags_create_and_truncate() {
    for scheme in SCHEMES {
        let (_, fs) = mount(scheme);

        let err = fs.open("/f", OpenFlags::RDWR).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT, "{scheme:?}");

        let fh = fs.open("/f", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
        assert_eq!(fs.getattr("/f").unwrap().kind, FileKind::Regular);
        fs.write("/f", 0, b"contents").unwrap();
        fs.release(fh).unwrap();

        let err = fs
            .open("/f", OpenFlags::RDWR | OpenFlags::CREAT | OpenFlags::EXCL)
            .unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST, "{scheme:?}");

        let fh = fs.open("/f", OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap();
        assert_eq!(fs.getattr("/f").unwrap().size, 0, "{scheme:?}: truncated on open");
        fs.release(fh).unwrap();

        let err = fs.open("/", OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap_err();
        assert_eq!(err.errno(), libc::EISDIR);
        assert_eq!(fs.open_handles(), 0);
    }
}

#[test]
fn unmount_releases_handles_and_flushes() {
    let (backend, fs) = mount(Scheme::FullPath);
    fs.create("/f", 0o644).unwrap();
    let _left_open = fs.open("/f", OpenFlags::RDWR).unwrap();
    fs.write("/f", 0, b"kept").unwrap();
    assert!(
        fs.store().open::<Shared>("/f").unwrap().is_dirty(),
        "an open handle keeps the written size cached"
    );
    drop(fs);

    let fs = common::mount_on(&backend, Scheme::FullPath, Box::new(EvictOnLastClose));
    assert_eq!(&fs.read("/f", 0, 16).unwrap()[..], b"kept");
}

#[test]
fn state_survives_remount_on_disk() {
    for scheme in SCHEMES {
        let tmp = tempfile::tempdir().unwrap();
        let open = || -> Arc<dyn KvBackend> { Arc::new(DirBackend::open(tmp.path()).unwrap()) };
        let data = pattern(70, 5);

        {
            let fs = KvFs::mount(open(), mount_options(scheme, Box::new(EvictOnLastClose))).unwrap();
            fs.mkdir("/docs", 0o755).unwrap();
            fs.create("/docs/a.txt", 0o600).unwrap();
            fs.write("/docs/a.txt", 0, &data).unwrap();
            fs.create("/empty", 0o644).unwrap();
        }

        let fs = KvFs::mount(open(), mount_options(scheme, Box::new(EvictOnLastClose))).unwrap();
        assert_eq!(names(&fs.readdir("/").unwrap()), [".", "..", "docs", "empty"], "{scheme:?}");
        let attributes = fs.getattr("/docs/a.txt").unwrap();
        assert_eq!(attributes.size, 70);
        assert_eq!(attributes.mode, 0o100_600);
        assert_eq!((attributes.owner, attributes.group), (1000, 100));
        assert_eq!(&fs.read("/docs/a.txt", 0, 100).unwrap()[..], &data[..]);
        assert_eq!(fs.getattr("/empty").unwrap().size, 0);
    }
}

#[test]
fn paths_are_normalized_on_the_way_in() {
    for scheme in SCHEMES {
        let (backend, fs) = mount(scheme);
        fs.mkdir("/d/", 0o755).unwrap();
        assert_eq!(names(&fs.readdir("/").unwrap()), [".", "..", "d"], "{scheme:?}");
        assert_eq!(fs.readdir("/d").unwrap().len(), 2, "{scheme:?}: reachable without the slash");

        fs.create("//d//f", 0o644).unwrap();
        fs.write("/d/f/", 0, b"same file").unwrap();
        assert_eq!(&fs.read("/d///f", 0, 16).unwrap()[..], b"same file", "{scheme:?}");
        assert_eq!(names(&fs.readdir("//d/").unwrap()), [".", "..", "f"]);
        assert_eq!(fs.getattr("//").unwrap().kind, FileKind::Directory);

        fs.rename("/d/f/", "//d/g").unwrap();
        assert_eq!(names(&fs.readdir("/d").unwrap()), [".", "..", "g"], "{scheme:?}");

        if scheme == Scheme::FullPath {
            assert!(backend.has_key(b"/d"), "keys use the canonical form");
            assert!(!backend.has_key(b"/d/"));
        }
    }
}

#[test]
fn relative_and_dotted_paths_are_rejected() {
    let (_, fs) = mount(Scheme::FullPath);
    fs.mkdir("/d", 0o755).unwrap();

    for bad in ["d", "", "d/f", "/d/./f", "/d/../f", "/.."] {
        let err = fs.create(bad, 0o644).unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }), "{bad:?}: got {err:?}");
        assert_eq!(err.errno(), libc::EINVAL);
    }
    assert!(matches!(fs.getattr("d"), Err(Error::InvalidPath { .. })));
    assert!(matches!(fs.rename("/d", "e"), Err(Error::InvalidPath { .. })));
    assert_eq!(names(&fs.readdir("/").unwrap()), [".", "..", "d"], "nothing was created");
    assert_eq!(fs.readdir("/d").unwrap().len(), 2);
}
