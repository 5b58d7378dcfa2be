//! Location of the binaries to use for symbolizing an object.
//!
//! Crash logs reference objects by the path they had on the device. For
//! each such object the [`Resolver`] locates the binary inside an
//! extracted root file system as well as the best separate debug binary
//! available for it.
//!
//! Debug binary candidates are grouped in priority classes:
//!
//! | class | kinds |
//! |-------|-------|
//! | 3 | [`BuildIdTree`][ResolutionKind::BuildIdTree] |
//! | 2 | [`Overlay`][ResolutionKind::Overlay], [`RecursiveSearch`][ResolutionKind::RecursiveSearch] |
//! | 1 | [`GnuDebugLink`][ResolutionKind::GnuDebugLink], [`SameDir`][ResolutionKind::SameDir] |
//!
//! The highest class wins. Within a class the largest file is chosen,
//! with the lexically smallest path breaking ties.

mod index;
mod rootfs;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::path::PathBuf;

use crate::elf::read_build_id;
use crate::elf::read_debug_link;
use crate::elf::ElfParser;
use crate::log::debug;
use crate::log::warn;
use crate::util::hex_string;
use crate::Error;
use crate::IntoError as _;
use crate::Result;

use self::index::DebugIndex;

pub use self::rootfs::Rootfs;


/// The debug root used if none is configured explicitly.
pub const DEFAULT_DEBUG_ROOT: &str = "/usr/lib/debug/.build-id";


/// The strategy by which a debug binary was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResolutionKind {
    /// A `<binary>.debug` file next to the binary.
    SameDir,
    /// A file in a debug overlay tree mirroring the root file system.
    Overlay,
    /// A file in a build ID keyed tree.
    BuildIdTree,
    /// A file named by the binary's `.gnu_debuglink` section.
    GnuDebugLink,
    /// A file found by scanning the debug roots recursively.
    RecursiveSearch,
    /// No debug binary was found and the binary itself is used.
    StrippedFallback,
}

impl ResolutionKind {
    /// The priority class of the strategy. Higher is better.
    pub fn priority(self) -> u8 {
        match self {
            Self::BuildIdTree => 3,
            Self::Overlay | Self::RecursiveSearch => 2,
            Self::GnuDebugLink | Self::SameDir => 1,
            Self::StrippedFallback => 0,
        }
    }

    /// A textual representation of the strategy.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SameDir => "same-dir",
            Self::Overlay => "overlay",
            Self::BuildIdTree => "build-id-tree",
            Self::GnuDebugLink => "gnu-debuglink",
            Self::RecursiveSearch => "recursive-search",
            Self::StrippedFallback => "stripped-fallback",
        }
    }
}

impl Display for ResolutionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}


/// The outcome of checking a single candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A regular file was found.
    Found {
        /// The host path of the file.
        path: PathBuf,
        /// The size of the file, in bytes.
        size: u64,
    },
    /// No regular file exists at the candidate path.
    NotFound,
    /// The strategy could not be applied.
    Skipped(String),
}


/// A single resolution attempt, as recorded for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempt {
    /// The strategy used.
    pub kind: ResolutionKind,
    /// The logical candidate path, if the strategy got as far as
    /// producing one.
    pub candidate: Option<PathBuf>,
    /// What happened.
    pub outcome: Outcome,
}

impl Attempt {
    fn skipped<S>(kind: ResolutionKind, reason: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            kind,
            candidate: None,
            outcome: Outcome::Skipped(reason.into()),
        }
    }

    /// Check whether the attempt produced a file.
    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self.outcome, Outcome::Found { .. })
    }
}

impl Display for Attempt {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let kind = self.kind;
        match (&self.candidate, &self.outcome) {
            (Some(candidate), Outcome::Found { size, .. }) => {
                write!(f, "{kind}: found {} ({size} bytes)", candidate.display())
            }
            (None, Outcome::Found { path, size }) => {
                write!(f, "{kind}: found {} ({size} bytes)", path.display())
            }
            (Some(candidate), Outcome::NotFound) => {
                write!(f, "{kind}: no file at {}", candidate.display())
            }
            (None, Outcome::NotFound) => write!(f, "{kind}: no file found"),
            (_, Outcome::Skipped(reason)) => write!(f, "{kind}: {reason}"),
        }
    }
}


/// The binaries to use for symbolizing addresses of an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The host path of the object's binary. It may not exist.
    pub real_binary_path: PathBuf,
    /// The host path of the separate debug binary, if one was found.
    pub debug_binary_path: Option<PathBuf>,
    /// The strategy by which the debug binary was found.
    pub resolution_kind: ResolutionKind,
    /// The priority class of `resolution_kind`.
    pub resolution_priority: u8,
    /// The build ID used for the lookup, if any: the one from the log
    /// or, lacking that, the one read from the binary.
    pub build_id: Option<String>,
    /// Every attempt made, in order.
    pub attempts: Vec<Attempt>,
}

impl ResolvedTarget {
    /// The file to hand to the symbol backend: the debug binary if one
    /// was found, the binary itself otherwise.
    pub fn backend_target(&self) -> &Path {
        self.debug_binary_path
            .as_deref()
            .unwrap_or(&self.real_binary_path)
    }

    /// Check whether no separate debug binary was found.
    #[inline]
    pub fn is_fallback(&self) -> bool {
        self.resolution_kind == ResolutionKind::StrippedFallback
    }

    /// A summary of why no debug binary was found, if that is the case.
    pub fn failure_reason(&self) -> Option<String> {
        if !self.is_fallback() {
            return None
        }

        let mut reasons = self
            .attempts
            .iter()
            .filter(|attempt| !attempt.is_found())
            .map(Attempt::to_string)
            .collect::<Vec<_>>();
        let () = reasons.push("fallback to stripped origin binary".to_string());
        Some(reasons.join("; "))
    }
}


/// Memoized resolution results, keyed by `(object path, build ID)`.
#[derive(Debug, Default)]
pub struct TargetMemo {
    targets: HashMap<(String, Option<String>), ResolvedTarget>,
}

impl TargetMemo {
    /// Look up the result for an object.
    pub fn get(&self, object_path: &str, build_id: Option<&str>) -> Option<&ResolvedTarget> {
        let key = (object_path.to_string(), build_id.map(str::to_string));
        self.targets.get(&key)
    }

    /// The number of memoized results.
    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Check whether nothing got resolved yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}


/// A builder for configurable construction of [`Resolver`] objects.
///
/// By default the debug root is [`DEFAULT_DEBUG_ROOT`], recursive
/// search is disabled, and build IDs are read from binaries.
#[derive(Clone, Debug)]
pub struct Builder {
    /// See [`Builder::set_rootfs`].
    rootfs: Option<PathBuf>,
    /// See [`Builder::set_debug_roots`].
    debug_roots: Vec<PathBuf>,
    /// See [`Builder::enable_recursive_search`].
    recursive_search: bool,
    /// See [`Builder::enable_build_id_reading`].
    build_ids: bool,
}

impl Builder {
    /// Set the host path of the extracted root file system.
    pub fn set_rootfs<P>(mut self, rootfs: P) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.rootfs = Some(rootfs.into());
        self
    }

    /// Set the debug roots (logical paths), to be tried in order.
    ///
    /// An empty list selects [`DEFAULT_DEBUG_ROOT`].
    pub fn set_debug_roots<I, P>(mut self, roots: I) -> Builder
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.debug_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Enable/disable the recursive search for `*.debug` files below
    /// the debug roots.
    ///
    /// The search requires a scan of all debug roots upfront.
    pub fn enable_recursive_search(mut self, enable: bool) -> Builder {
        self.recursive_search = enable;
        self
    }

    /// Enable/disable reading of build IDs from binaries, used when the
    /// crash log does not provide one.
    pub fn enable_build_id_reading(mut self, enable: bool) -> Builder {
        self.build_ids = enable;
        self
    }

    /// Create the [`Resolver`] object.
    ///
    /// Fails if no root file system is configured or it does not exist.
    pub fn build(self) -> Result<Resolver> {
        let Builder {
            rootfs,
            mut debug_roots,
            recursive_search,
            build_ids,
        } = self;

        let rootfs = rootfs.ok_or_invalid_input(|| "no root file system configured")?;
        if !rootfs.is_dir() {
            return Err(Error::with_not_found(format!(
                "root file system {} does not exist or is not a directory",
                rootfs.display()
            )))
        }
        let rootfs = Rootfs::new(rootfs);

        if debug_roots.is_empty() {
            let () = debug_roots.push(PathBuf::from(DEFAULT_DEBUG_ROOT));
        }

        let mut debug_parents = Vec::<PathBuf>::new();
        for root in &debug_roots {
            let parent = root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            if !debug_parents.contains(&parent) {
                let () = debug_parents.push(parent);
            }
        }

        let index = recursive_search.then(|| DebugIndex::build(&rootfs, &debug_roots));

        Ok(Resolver {
            rootfs,
            debug_roots,
            debug_parents,
            index,
            build_ids,
            memo: TargetMemo::default(),
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            rootfs: None,
            debug_roots: Vec::new(),
            recursive_search: false,
            build_ids: true,
        }
    }
}


fn with_debug_suffix(path: PathBuf) -> PathBuf {
    let mut path = path.into_os_string();
    let () = path.push(".debug");
    PathBuf::from(path)
}

fn debug_file_name(name: &OsStr) -> OsString {
    let mut name = name.to_os_string();
    let () = name.push(".debug");
    name
}

/// Validate and normalize a build ID for use as a lookup key.
fn lookup_build_id(build_id: &str) -> Option<String> {
    let valid = build_id.len() >= 3 && build_id.bytes().all(|b| b.is_ascii_hexdigit());
    valid.then(|| build_id.to_ascii_lowercase())
}


#[derive(Debug)]
struct Found {
    kind: ResolutionKind,
    path: PathBuf,
    size: u64,
}


/// A resolver of object paths to binaries inside a root file system.
///
/// Results are memoized for the lifetime of the object.
#[derive(Debug)]
pub struct Resolver {
    rootfs: Rootfs,
    debug_roots: Vec<PathBuf>,
    /// The parents of `debug_roots`, deduplicated.
    debug_parents: Vec<PathBuf>,
    index: Option<DebugIndex>,
    build_ids: bool,
    memo: TargetMemo,
}

impl Resolver {
    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`Resolver`].
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Retrieve the root file system in use.
    #[inline]
    pub fn rootfs(&self) -> &Rootfs {
        &self.rootfs
    }

    /// Retrieve the memoized results.
    #[inline]
    pub fn memo(&self) -> &TargetMemo {
        &self.memo
    }

    /// Resolve an object, as referenced by a crash log, to the binaries
    /// to use for symbolization.
    ///
    /// This method never fails: if no debug binary can be found the
    /// result is a [`StrippedFallback`][ResolutionKind::StrippedFallback]
    /// target listing all attempts made.
    pub fn resolve(&mut self, object_path: &str, build_id: Option<&str>) -> &ResolvedTarget {
        let key = (object_path.to_string(), build_id.map(str::to_string));
        if !self.memo.targets.contains_key(&key) {
            let target = self.find_target(object_path, build_id);
            let _prev = self.memo.targets.insert(key.clone(), target);
        }
        // The entry got inserted above if it was not present.
        &self.memo.targets[&key]
    }

    /// Determine the build ID to use for lookups, consulting the binary
    /// itself if possible.
    fn effective_build_id(
        &self,
        object_path: &str,
        log_build_id: Option<&str>,
        elf: Option<&ElfParser>,
    ) -> Option<String> {
        let found = if self.build_ids {
            elf.and_then(|elf| match read_build_id(elf) {
                Ok(build_id) => build_id.map(|build_id| hex_string(&build_id)),
                Err(err) => {
                    debug!("failed to read build ID of {object_path}: {err:#}");
                    None
                }
            })
        } else {
            None
        };

        match (log_build_id, found) {
            (Some(log), Some(found)) => {
                if !log.eq_ignore_ascii_case(&found) {
                    warn!(
                        "build ID mismatch for {object_path}: log reports {log}, binary contains {found}"
                    );
                }
                Some(log.to_string())
            }
            (Some(log), None) => Some(log.to_string()),
            (None, Some(found)) => {
                debug!("using build ID {found} read from {object_path}");
                Some(found)
            }
            (None, None) => None,
        }
    }

    fn debug_link_candidates(
        &self,
        dir: &Path,
        elf: Option<&ElfParser>,
        candidates: &mut Vec<(ResolutionKind, PathBuf)>,
        attempts: &mut Vec<Attempt>,
    ) {
        let kind = ResolutionKind::GnuDebugLink;
        let elf = match elf {
            Some(elf) => elf,
            None => {
                let () = attempts.push(Attempt::skipped(kind, "origin binary not readable"));
                return
            }
        };

        let link = match read_debug_link(elf) {
            Ok(Some(link)) => link,
            Ok(None) => {
                let () = attempts.push(Attempt::skipped(kind, "no .gnu_debuglink section"));
                return
            }
            Err(err) => {
                let () = attempts.push(Attempt::skipped(
                    kind,
                    format!("failed to read .gnu_debuglink: {err}"),
                ));
                return
            }
        };

        let () = candidates.push((kind, dir.join(link.file)));
        let () = candidates.push((kind, dir.join(".debug").join(link.file)));
        for parent in &self.debug_parents {
            let rel = dir.strip_prefix("/").unwrap_or(dir);
            let () = candidates.push((kind, parent.join(rel).join(link.file)));
        }
    }

    fn overlay_candidates(&self, object_path: &str, candidates: &mut Vec<(ResolutionKind, PathBuf)>) {
        let kind = ResolutionKind::Overlay;
        let rel = object_path.trim_start_matches('/');
        let base = Path::new(object_path).file_name();

        for parent in &self.debug_parents {
            let () = candidates.push((kind, with_debug_suffix(parent.join(rel))));
            if let Some(rest) = object_path.strip_prefix("/usr/") {
                let () = candidates.push((kind, with_debug_suffix(parent.join(rest))));
            }

            if object_path.starts_with("/usr/lib64/") || object_path.starts_with("/lib64/") {
                if let Some(base) = base {
                    let candidate = parent.join("lib64.tizen-debug").join(debug_file_name(base));
                    let () = candidates.push((kind, candidate));
                }
            }
        }
    }

    fn build_id_candidates(
        &self,
        build_id: Option<&str>,
        candidates: &mut Vec<(ResolutionKind, PathBuf)>,
        attempts: &mut Vec<Attempt>,
    ) {
        let kind = ResolutionKind::BuildIdTree;
        let build_id = match build_id {
            Some(build_id) => build_id,
            None => {
                let () = attempts.push(Attempt::skipped(kind, "no build ID available"));
                return
            }
        };

        let build_id = match lookup_build_id(build_id) {
            Some(build_id) => build_id,
            None => {
                let () = attempts.push(Attempt::skipped(
                    kind,
                    format!("build ID {build_id} is not usable for lookup"),
                ));
                return
            }
        };

        let (head, tail) = build_id.split_at(2);
        for root in &self.debug_roots {
            let dir = root.join(head);
            let () = candidates.push((kind, dir.join(format!("{tail}.debug"))));
            let () = candidates.push((kind, dir.join(tail)));
        }
    }

    fn find_target(&self, object_path: &str, build_id: Option<&str>) -> ResolvedTarget {
        let logical = Path::new(object_path);
        let mut attempts = Vec::new();
        let mut candidates = Vec::new();

        let origin = self.rootfs.find_file(logical).map(|(path, _meta)| path);
        let real_binary_path = origin
            .clone()
            .unwrap_or_else(|| self.rootfs.join(logical));
        if origin.is_none() {
            let () = attempts.push(Attempt {
                kind: ResolutionKind::StrippedFallback,
                candidate: Some(logical.to_path_buf()),
                outcome: Outcome::Skipped("origin binary missing in root file system".to_string()),
            });
        }

        let elf = origin.as_ref().and_then(|path| match ElfParser::open(path) {
            Ok(elf) => Some(elf),
            Err(err) => {
                debug!("failed to parse {}: {err:#}", path.display());
                None
            }
        });

        let build_id = self.effective_build_id(object_path, build_id, elf.as_ref());
        let dir = logical.parent().unwrap_or_else(|| Path::new("/"));

        let () = self.debug_link_candidates(dir, elf.as_ref(), &mut candidates, &mut attempts);
        if let Some(base) = logical.file_name() {
            let () = candidates.push((ResolutionKind::SameDir, dir.join(debug_file_name(base))));
        }
        let () = self.overlay_candidates(object_path, &mut candidates);
        if let Some(index) = &self.index {
            if let Some(base) = logical.file_name() {
                let name = debug_file_name(base);
                let paths = index.lookup(&name);
                if paths.is_empty() {
                    let () = attempts.push(Attempt::skipped(
                        ResolutionKind::RecursiveSearch,
                        format!("no indexed file named {}", Path::new(&name).display()),
                    ));
                }
                for path in paths {
                    let () = candidates.push((ResolutionKind::RecursiveSearch, path.clone()));
                }
            }
        }
        let () = self.build_id_candidates(build_id.as_deref(), &mut candidates, &mut attempts);

        let mut found = Vec::<Found>::new();
        for (kind, candidate) in candidates {
            let file = if kind == ResolutionKind::BuildIdTree {
                self.rootfs.find_file_one_hop(&candidate)
            } else {
                self.rootfs.find_file(&candidate)
            };

            let outcome = match file {
                Some((path, _meta)) if Some(&path) == origin.as_ref() => Outcome::Skipped(format!(
                    "{} is the origin binary itself",
                    candidate.display()
                )),
                Some((path, meta)) => {
                    let size = meta.len();
                    if let Some(existing) = found.iter_mut().find(|entry| entry.path == path) {
                        if kind.priority() > existing.kind.priority() {
                            existing.kind = kind;
                        }
                    } else {
                        let () = found.push(Found {
                            kind,
                            path: path.clone(),
                            size,
                        });
                    }
                    Outcome::Found { path, size }
                }
                None => Outcome::NotFound,
            };

            let () = attempts.push(Attempt {
                kind,
                candidate: Some(candidate),
                outcome,
            });
        }

        let best = found.into_iter().max_by(|a, b| {
            a.kind
                .priority()
                .cmp(&b.kind.priority())
                .then(a.size.cmp(&b.size))
                .then_with(|| b.path.cmp(&a.path))
        });

        match best {
            Some(Found { kind, path, .. }) => {
                debug!(
                    "resolved {object_path} to debug binary {} ({kind})",
                    path.display()
                );
                ResolvedTarget {
                    real_binary_path,
                    debug_binary_path: Some(path),
                    resolution_kind: kind,
                    resolution_priority: kind.priority(),
                    build_id,
                    attempts,
                }
            }
            None => {
                debug!("no debug binary found for {object_path}");
                ResolvedTarget {
                    real_binary_path,
                    debug_binary_path: None,
                    resolution_kind: ResolutionKind::StrippedFallback,
                    resolution_priority: ResolutionKind::StrippedFallback.priority(),
                    build_id,
                    attempts,
                }
            }
        }
    }
}
