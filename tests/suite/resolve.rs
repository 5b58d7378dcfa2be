use std::os::unix::fs::symlink;
use std::path::Path;

use qss::resolve::ResolutionKind;
use qss::resolve::Resolver;

use tempfile::tempdir;
use test_log::test;

use super::common::put;


/// Check that a higher priority class beats a larger file.
#[test]
fn priority_before_size() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let _path = put(root, "/usr/lib64/libfoo.so", b"stripped");
    let _path = put(root, "/usr/lib64/libfoo.so.debug", &[0; 4096]);
    let expected = put(root, "/usr/lib/debug/.build-id/aa/0d6e.debug", b"small");

    let mut resolver = Resolver::builder().set_rootfs(root).build().unwrap();
    let target = resolver.resolve("/usr/lib64/libfoo.so", Some("AA0D6E"));
    assert_eq!(target.resolution_kind, ResolutionKind::BuildIdTree);
    assert_eq!(target.resolution_priority, 3);
    assert_eq!(target.debug_binary_path.as_deref(), Some(expected.as_path()));
    assert_eq!(target.real_binary_path, root.join("usr/lib64/libfoo.so"));

    // Without a build ID the same directory candidate is all there is.
    let target = resolver.resolve("/usr/lib64/libfoo.so", None);
    assert_eq!(target.resolution_kind, ResolutionKind::SameDir);
}

/// Check that the largest file wins within a priority class.
#[test]
fn size_within_class() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let _path = put(root, "/usr/lib64/libfoo.so", b"stripped");
    let _path = put(root, "/usr/lib/debug/usr/lib64/libfoo.so.debug", b"overlay");
    let expected = put(
        root,
        "/usr/lib/debug/.build-id/zz/libfoo.so.debug",
        b"a much larger debug binary",
    );

    let mut resolver = Resolver::builder()
        .set_rootfs(root)
        .enable_recursive_search(true)
        .build()
        .unwrap();
    let target = resolver.resolve("/usr/lib64/libfoo.so", None);
    assert_eq!(target.resolution_kind, ResolutionKind::RecursiveSearch);
    assert_eq!(target.resolution_priority, 2);
    assert_eq!(target.debug_binary_path.as_deref(), Some(expected.as_path()));

    // Without the recursive search the overlay is used.
    let mut resolver = Resolver::builder().set_rootfs(root).build().unwrap();
    let target = resolver.resolve("/usr/lib64/libfoo.so", None);
    assert_eq!(target.resolution_kind, ResolutionKind::Overlay);
}

/// Check that symbolic links cannot be used to escape the root file
/// system.
#[test]
fn rootfs_escape() {
    let outer = tempdir().unwrap();
    let root = outer.path().join("rootfs");
    let secret = put(outer.path(), "/secret.debug", b"host file");
    let _path = put(&root, "/usr/lib64/libfoo.so", b"stripped");
    let _path = put(&root, "/usr/lib/debug/.build-id/aa/README", b"");

    let () = symlink(
        "../../../../../../secret.debug",
        root.join("usr/lib/debug/.build-id/aa/0d6e.debug"),
    )
    .unwrap();
    let () = symlink(&secret, root.join("usr/lib64/libfoo.so.debug")).unwrap();

    let mut resolver = Resolver::builder().set_rootfs(&root).build().unwrap();
    let target = resolver.resolve("/usr/lib64/libfoo.so", Some("aa0d6e"));
    assert!(target.is_fallback());
    assert_eq!(target.debug_binary_path, None);
    assert_eq!(target.backend_target(), root.join("usr/lib64/libfoo.so"));
    assert!(!target.backend_target().starts_with(Path::new(&secret)));

    let reason = target.failure_reason().unwrap();
    assert!(reason.ends_with("fallback to stripped origin binary"), "{reason}");
}
