//! Path handling inside an extracted root file system.
//!
//! Paths recorded in crash logs are *logical* paths, i.e., they are
//! only meaningful when interpreted with the root file system as `/`.
//! Symbolic links inside the tree frequently are absolute and so they,
//! too, have to be interpreted relative to the root file system, much
//! like `chroot(2)` would do.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::read_link;
use std::fs::symlink_metadata;
use std::fs::Metadata;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;


/// The maximum number of symbolic links followed while resolving a
/// single path.
const MAX_LINK_HOPS: usize = 40;


#[derive(Clone, Debug, PartialEq, Eq)]
enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> impl DoubleEndedIterator<Item = Step> + '_ {
    path.components().filter_map(|component| match component {
        Component::Prefix(..) | Component::RootDir | Component::CurDir => None,
        Component::ParentDir => Some(Step::Parent),
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
    })
}

/// Lexically normalize an absolute logical path, failing if a `..`
/// component would leave the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::from("/");
    for step in steps(path) {
        match step {
            Step::Parent => {
                if !normalized.pop() {
                    return None
                }
            }
            Step::Name(name) => normalized.push(name),
        }
    }
    Some(normalized)
}


/// An extracted root file system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rootfs {
    /// The host path of the root directory.
    root: PathBuf,
}

impl Rootfs {
    /// Create a `Rootfs` object for the tree at `root`.
    pub fn new<P>(root: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self { root: root.into() }
    }

    /// Retrieve the host path of the root directory.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lexically map a logical path to a host path, without looking at
    /// the file system.
    ///
    /// `..` components are dropped. The result is meant for reporting
    /// purposes and may not exist.
    pub fn join(&self, logical: &Path) -> PathBuf {
        let mut path = self.root.clone();
        for component in logical.components() {
            if let Component::Normal(name) = component {
                let () = path.push(name);
            }
        }
        path
    }

    /// Walk `logical`, resolving symbolic links inside the root file
    /// system, and return the physical logical path.
    ///
    /// A symbolic link as the last component is only followed if
    /// `follow_final` is set. `None` is returned if a component does
    /// not exist or the link hop limit got exceeded.
    fn walk(&self, logical: &Path, follow_final: bool) -> Option<PathBuf> {
        let mut resolved = PathBuf::from("/");
        let mut pending = steps(logical).collect::<VecDeque<_>>();
        let mut hops = 0;

        while let Some(step) = pending.pop_front() {
            let name = match step {
                Step::Parent => {
                    // `..` at the root stays at the root.
                    let _popped = resolved.pop();
                    continue
                }
                Step::Name(name) => name,
            };

            let candidate = resolved.join(&name);
            let host = self.join(&candidate);
            let meta = symlink_metadata(&host).ok()?;
            let is_final = pending.is_empty();

            if meta.file_type().is_symlink() && (follow_final || !is_final) {
                hops += 1;
                if hops > MAX_LINK_HOPS {
                    return None
                }

                let target = read_link(&host).ok()?;
                if target.is_absolute() {
                    resolved = PathBuf::from("/");
                }
                for step in steps(&target).rev() {
                    let () = pending.push_front(step);
                }
            } else {
                resolved = candidate;
            }
        }
        Some(resolved)
    }

    /// Resolve a logical path to the host path of the entity it refers
    /// to, following all symbolic links with chroot semantics.
    pub fn resolve(&self, logical: &Path) -> Option<PathBuf> {
        self.walk(logical, true).map(|resolved| self.join(&resolved))
    }

    /// Resolve a logical path to a regular file, following all symbolic
    /// links with chroot semantics.
    pub fn find_file(&self, logical: &Path) -> Option<(PathBuf, Metadata)> {
        let host = self.resolve(logical)?;
        let meta = host.metadata().ok()?;
        meta.is_file().then_some((host, meta))
    }

    /// Resolve a logical path to a regular file, following a symbolic
    /// link in the last component exactly once.
    ///
    /// Absolute link targets are interpreted relative to the root file
    /// system, relative ones relative to the directory containing the
    /// link. A link target escaping the root file system is treated as
    /// not found.
    pub fn find_file_one_hop(&self, logical: &Path) -> Option<(PathBuf, Metadata)> {
        let link = self.walk(logical, false)?;
        let host = self.join(&link);
        let meta = symlink_metadata(&host).ok()?;

        let target = if meta.file_type().is_symlink() {
            let target = read_link(&host).ok()?;
            let target = if target.is_absolute() {
                target
            } else {
                link.parent().unwrap_or_else(|| Path::new("/")).join(target)
            };
            normalize_lexically(&target)?
        } else {
            link
        };

        let target = self.walk(&target, false)?;
        let host = self.join(&target);
        let meta = symlink_metadata(&host).ok()?;
        meta.is_file().then_some((host, meta))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::create_dir_all;
    use std::fs::write;
    use std::os::unix::fs::symlink;

    use tempfile::tempdir;
    use test_log::test;


    /// Check that `..` components cannot leave the root lexically.
    #[test]
    fn lexical_normalization() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c")),
            Some(PathBuf::from("/a/c"))
        );
        assert_eq!(normalize_lexically(Path::new("/a/./b")), Some(PathBuf::from("/a/b")));
        assert_eq!(normalize_lexically(Path::new("/a/../..")), None);
        assert_eq!(normalize_lexically(Path::new("/..")), None);
    }

    /// Check that logical paths are mapped into the root file system
    /// lexically.
    #[test]
    fn lexical_join() {
        let rootfs = Rootfs::new("/srv/rootfs");
        assert_eq!(
            rootfs.join(Path::new("/usr/lib64/libfoo.so")),
            Path::new("/srv/rootfs/usr/lib64/libfoo.so")
        );
        assert_eq!(
            rootfs.join(Path::new("/../../etc/passwd")),
            Path::new("/srv/rootfs/etc/passwd")
        );
    }

    /// Check that absolute symbolic links are interpreted inside the
    /// root file system.
    #[test]
    fn absolute_link_rerooting() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let () = create_dir_all(root.join("usr/lib64")).unwrap();
        let () = write(root.join("usr/lib64/libfoo.so.1.2"), b"foo").unwrap();
        let () = symlink("/usr/lib64/libfoo.so.1.2", root.join("usr/lib64/libfoo.so")).unwrap();
        let () = symlink("/usr/lib64", root.join("lib64")).unwrap();

        let rootfs = Rootfs::new(root);
        let (path, meta) = rootfs.find_file(Path::new("/lib64/libfoo.so")).unwrap();
        assert_eq!(path, root.join("usr/lib64/libfoo.so.1.2"));
        assert_eq!(meta.len(), 3);

        assert!(rootfs.find_file(Path::new("/usr/lib64")).is_none());
        assert!(rootfs.find_file(Path::new("/usr/lib64/missing.so")).is_none());
    }

    /// Make sure that links pointing outside of the root file system are
    /// not followed to the host.
    #[test]
    fn rootfs_escape_rejection() {
        let outer = tempdir().unwrap();
        let () = write(outer.path().join("secret"), b"secret").unwrap();
        let root = outer.path().join("rootfs");
        let () = create_dir_all(root.join("usr/lib")).unwrap();

        // An absolute link to a host path that only exists outside.
        let () = symlink(outer.path().join("secret"), root.join("usr/lib/abs")).unwrap();
        // A relative link climbing above the root.
        let () = symlink("../../../secret", root.join("usr/lib/rel")).unwrap();

        let rootfs = Rootfs::new(&root);
        assert!(rootfs.find_file(Path::new("/usr/lib/abs")).is_none());
        assert!(rootfs.find_file(Path::new("/usr/lib/rel")).is_none());
        assert!(rootfs.find_file(Path::new("/../secret")).is_none());
        assert!(rootfs.find_file_one_hop(Path::new("/usr/lib/abs")).is_none());
        assert!(rootfs.find_file_one_hop(Path::new("/usr/lib/rel")).is_none());

        // `..` is clamped at the root during regular resolution.
        let () = write(root.join("secret"), b"inside").unwrap();
        let (path, _meta) = rootfs.find_file(Path::new("/usr/lib/rel")).unwrap();
        assert_eq!(path, root.join("secret"));
        // But a one hop link climbing above the root is rejected.
        assert!(rootfs.find_file_one_hop(Path::new("/usr/lib/rel")).is_none());
    }

    /// Check that link cycles are detected.
    #[test]
    fn link_cycle() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let () = symlink("/b", root.join("a")).unwrap();
        let () = symlink("/a", root.join("b")).unwrap();

        let rootfs = Rootfs::new(root);
        assert_eq!(rootfs.resolve(Path::new("/a")), None);
        assert!(rootfs.find_file(Path::new("/a")).is_none());
    }

    /// Check that exactly one link hop is taken by
    /// `find_file_one_hop`.
    #[test]
    fn one_hop_resolution() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let () = create_dir_all(root.join("usr/lib/debug/.build-id/aa")).unwrap();
        let () = create_dir_all(root.join("usr/lib64/.debug")).unwrap();
        let () = write(root.join("usr/lib64/.debug/libfoo.so.debug"), b"debug").unwrap();
        let () = symlink(
            "../../../../lib64/.debug/libfoo.so.debug",
            root.join("usr/lib/debug/.build-id/aa/0d.debug"),
        )
        .unwrap();
        let () = symlink(
            "/usr/lib64/.debug/libfoo.so.debug",
            root.join("usr/lib/debug/.build-id/aa/0e.debug"),
        )
        .unwrap();
        let () = symlink(
            "/usr/lib/debug/.build-id/aa/0e.debug",
            root.join("usr/lib/debug/.build-id/aa/0f.debug"),
        )
        .unwrap();

        let rootfs = Rootfs::new(root);
        let expected = root.join("usr/lib64/.debug/libfoo.so.debug");
        let (path, _meta) = rootfs
            .find_file_one_hop(Path::new("/usr/lib/debug/.build-id/aa/0d.debug"))
            .unwrap();
        assert_eq!(path, expected);
        let (path, _meta) = rootfs
            .find_file_one_hop(Path::new("/usr/lib/debug/.build-id/aa/0e.debug"))
            .unwrap();
        assert_eq!(path, expected);
        // A chain of two links is not followed.
        assert!(rootfs
            .find_file_one_hop(Path::new("/usr/lib/debug/.build-id/aa/0f.debug"))
            .is_none());
        // Regular files are found as well.
        let (path, _meta) = rootfs
            .find_file_one_hop(Path::new("/usr/lib64/.debug/libfoo.so.debug"))
            .unwrap();
        assert_eq!(path, expected);
    }
}
