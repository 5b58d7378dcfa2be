use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fs::read_dir;
use std::fs::read_link;
use std::path::Path;
use std::path::PathBuf;

use crate::log::debug;
use crate::log::warn;

use super::rootfs::Rootfs;


fn is_debug_name(name: &OsStr) -> bool {
    Path::new(name).extension() == Some(OsStr::new("debug"))
}


/// An index of all `*.debug` files below a set of debug roots.
///
/// Files are indexed by their own name and, if they are symbolic links,
/// additionally by the name of the link target. All paths are logical
/// paths inside the root file system.
#[derive(Debug, Default)]
pub(crate) struct DebugIndex {
    files: HashMap<OsString, Vec<PathBuf>>,
}

impl DebugIndex {
    /// Scan the provided debug roots (logical paths).
    pub(crate) fn build(rootfs: &Rootfs, debug_roots: &[PathBuf]) -> Self {
        let mut index = Self::default();
        for root in debug_roots {
            match rootfs.resolve(root) {
                Some(host) if host.is_dir() => {
                    let () = index.scan(&host, root);
                }
                _ => debug!("debug root {} does not exist; skipping", root.display()),
            }
        }

        // Deterministic candidate order irrespective of directory
        // iteration order.
        for paths in index.files.values_mut() {
            let () = paths.sort();
            let () = paths.dedup();
        }
        debug!("indexed {} debug file names", index.files.len());
        index
    }

    fn scan(&mut self, host_dir: &Path, logical_dir: &Path) {
        let entries = match read_dir(host_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read directory {}: {err}", host_dir.display());
                return
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let logical = logical_dir.join(&name);
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(..) => continue,
            };

            if file_type.is_dir() {
                let () = self.scan(&entry.path(), &logical);
                continue
            }

            if !is_debug_name(&name) {
                continue
            }

            if file_type.is_symlink() {
                let target_name = read_link(entry.path())
                    .ok()
                    .and_then(|target| target.file_name().map(OsStr::to_os_string));
                if let Some(target_name) = target_name {
                    if is_debug_name(&target_name) && target_name != name {
                        let () = self
                            .files
                            .entry(target_name)
                            .or_default()
                            .push(logical.clone());
                    }
                }
            }
            let () = self.files.entry(name).or_default().push(logical);
        }
    }

    /// Look up all indexed files with the given name.
    pub(crate) fn lookup(&self, name: &OsStr) -> &[PathBuf] {
        self.files.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}
