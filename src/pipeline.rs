//! Batch symbolization of crash log files.
//!
//! A [`Pipeline`] ties all the pieces together: it parses a set of
//! logs, symbolizes every referenced address not covered by the cache,
//! persists new results, writes the symbolized logs, and records all
//! failures in a report.

use std::fs::create_dir_all;
use std::fs::read;
use std::fs::read_dir;
use std::fs::write;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::unbounded;

use crate::backend::Adapter;
use crate::backend::Addr2Line;
use crate::backend::Flavor;
use crate::backend::SymbolBackend;
use crate::cache::CacheStore;
#[cfg(feature = "sqlite")]
use crate::cache::SqliteStore;
use crate::cache::SymbolTable;
use crate::failure::write_report;
use crate::failure::FailureRecord;
use crate::failure::FAILURE_REPORT_NAME;
use crate::log::debug;
use crate::log::info;
use crate::log::warn;
use crate::merge::merge;
use crate::parse::parse;
use crate::parse::ParsedLog;
use crate::render::render_all;
use crate::resolve::Resolver;
use crate::schedule::Scheduler;
use crate::Error;
use crate::ErrorExt as _;
#[cfg(not(feature = "sqlite"))]
use crate::ErrorKind;
use crate::Mode;
use crate::Result;


/// Where symbolized logs are written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    /// Write every input log, with the symbolized traces merged in, to
    /// the same relative path below a directory.
    Merge(PathBuf),
    /// Write only the symbolized traces of all inputs to a single file.
    Stacks(PathBuf),
}


/// A builder for configurable construction of [`Pipeline`] objects.
///
/// Everything but the root file system and the output has a usable
/// default: GNU `addr2line` from `PATH`, batched mode with demangling,
/// no persistent cache, and as many workers as there are CPUs.
#[derive(Debug)]
pub struct Builder {
    rootfs: Option<PathBuf>,
    debug_roots: Vec<PathBuf>,
    recursive_search: bool,
    flavor: Flavor,
    executable: Option<PathBuf>,
    cross_prefix: Option<String>,
    backend: Option<Box<dyn SymbolBackend>>,
    workers_symbols: usize,
    workers_rewrite: usize,
    mode: Mode,
    demangle: bool,
    cache_db: Option<PathBuf>,
    cache_store: Option<Box<dyn CacheStore>>,
    extension: Option<String>,
    output: Option<Output>,
    failure_report: Option<PathBuf>,
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
    pub fn set_debug_roots<I, P>(mut self, roots: I) -> Builder
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.debug_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Enable/disable the recursive search for debug files below the
    /// debug roots.
    pub fn enable_recursive_search(mut self, enable: bool) -> Builder {
        self.recursive_search = enable;
        self
    }

    /// Set the `addr2line` flavor.
    pub fn set_flavor(mut self, flavor: Flavor) -> Builder {
        self.flavor = flavor;
        self
    }

    /// Set the `addr2line` executable.
    pub fn set_executable<P>(mut self, executable: Option<P>) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.executable = executable.map(Into::into);
        self
    }

    /// Set a cross toolchain prefix such as `aarch64-linux-gnu-`.
    pub fn set_cross_prefix<S>(mut self, prefix: Option<S>) -> Builder
    where
        S: Into<String>,
    {
        self.cross_prefix = prefix.map(Into::into);
        self
    }

    /// Use a custom [`SymbolBackend`] instead of `addr2line`.
    pub fn set_backend(mut self, backend: Box<dyn SymbolBackend>) -> Builder {
        self.backend = Some(backend);
        self
    }

    /// Set the number of threads symbolizing binaries in parallel.
    ///
    /// Zero selects the available parallelism.
    pub fn set_workers_symbols(mut self, workers: usize) -> Builder {
        self.workers_symbols = workers;
        self
    }

    /// Set the number of threads writing output files in parallel.
    ///
    /// Zero selects the available parallelism.
    pub fn set_workers_rewrite(mut self, workers: usize) -> Builder {
        self.workers_rewrite = workers;
        self
    }

    /// Enable/disable expansion of inlined functions.
    ///
    /// Inline expansion invokes the symbol backend once per address.
    pub fn enable_inline(mut self, enable: bool) -> Builder {
        self.mode = if enable { Mode::Inline } else { Mode::Batched };
        self
    }

    /// Enable/disable demangling of function names.
    pub fn enable_demangling(mut self, enable: bool) -> Builder {
        self.demangle = enable;
        self
    }

    /// Set the path of an SQLite database to persist results in.
    ///
    /// Requires the `sqlite` feature.
    pub fn set_cache_db<P>(mut self, path: Option<P>) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.cache_db = path.map(Into::into);
        self
    }

    /// Use a custom [`CacheStore`], taking precedence over
    /// [`set_cache_db`](Self::set_cache_db).
    pub fn set_cache_store(mut self, store: Box<dyn CacheStore>) -> Builder {
        self.cache_store = Some(store);
        self
    }

    /// Only consider files with names ending in `extension` when
    /// scanning input directories.
    ///
    /// By default every regular file is considered.
    pub fn set_extension<S>(mut self, extension: Option<S>) -> Builder
    where
        S: Into<String>,
    {
        self.extension = extension.map(Into::into);
        self
    }

    /// Write merged logs below `dir`.
    pub fn set_merge_output<P>(mut self, dir: P) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.output = Some(Output::Merge(dir.into()));
        self
    }

    /// Write the symbolized stack traces of all logs to `path`.
    pub fn set_output<P>(mut self, path: P) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.output = Some(Output::Stacks(path.into()));
        self
    }

    /// Set the path of the failure report.
    ///
    /// By default the report is written as [`FAILURE_REPORT_NAME`] into
    /// the output directory or, for stack output, next to the output
    /// file.
    pub fn set_failure_report<P>(mut self, path: Option<P>) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.failure_report = path.map(Into::into);
        self
    }

    fn open_cache(
        cache_db: Option<PathBuf>,
        cache_store: Option<Box<dyn CacheStore>>,
    ) -> Result<Option<Box<dyn CacheStore>>> {
        if let Some(store) = cache_store {
            return Ok(Some(store))
        }

        match cache_db {
            #[cfg(feature = "sqlite")]
            Some(path) => {
                let store = SqliteStore::open(path)?;
                Ok(Some(Box::new(store)))
            }
            #[cfg(not(feature = "sqlite"))]
            Some(path) => Err(Error::new(
                ErrorKind::Unsupported,
                format!(
                    "cannot use cache database {}: the `sqlite` feature is disabled",
                    path.display()
                ),
            )),
            None => Ok(None),
        }
    }

    /// Create the [`Pipeline`] object.
    ///
    /// This fails if the root file system or the output are not
    /// configured, the cache database cannot be opened, or the
    /// `addr2line` executable cannot be run.
    pub fn build(self) -> Result<Pipeline> {
        let Builder {
            rootfs,
            debug_roots,
            recursive_search,
            flavor,
            executable,
            cross_prefix,
            backend,
            workers_symbols,
            workers_rewrite,
            mode,
            demangle,
            cache_db,
            cache_store,
            extension,
            output,
            failure_report,
        } = self;

        let output = output.ok_or_else(|| {
            Error::with_invalid_input("no output configured: need a merge directory or output file")
        })?;

        let mut resolver = Resolver::builder()
            .set_debug_roots(debug_roots)
            .enable_recursive_search(recursive_search);
        if let Some(rootfs) = rootfs {
            resolver = resolver.set_rootfs(rootfs);
        }
        let resolver = resolver.build()?;

        let backend = match backend {
            Some(backend) => backend,
            None => {
                let addr2line = Addr2Line::builder()
                    .set_flavor(flavor)
                    .set_executable(executable)
                    .set_cross_prefix(cross_prefix)
                    .enable_demangling(demangle)
                    .build();
                let version = addr2line.probe().with_context(|| {
                    format!(
                        "symbol backend {} is not usable",
                        addr2line.executable().display()
                    )
                })?;
                info!("using {}: {version}", addr2line.executable().display());
                Box::new(addr2line)
            }
        };

        let store = Self::open_cache(cache_db, cache_store)?;
        let adapter = Adapter::new(backend, mode).set_demangle(demangle);

        Ok(Pipeline {
            resolver,
            adapter,
            scheduler: Scheduler::new(workers_symbols),
            rewriters: Scheduler::new(workers_rewrite).workers(),
            store,
            extension,
            output,
            failure_report,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            rootfs: None,
            debug_roots: Vec::new(),
            recursive_search: false,
            flavor: Flavor::default(),
            executable: None,
            cross_prefix: None,
            backend: None,
            workers_symbols: 0,
            workers_rewrite: 0,
            mode: Mode::default(),
            demangle: true,
            cache_db: None,
            cache_store: None,
            extension: None,
            output: None,
            failure_report: None,
        }
    }
}


/// The outcome of a [`Pipeline::run`].
#[derive(Clone, Debug, Default)]
pub struct Report {
    /// The log files processed.
    pub inputs: Vec<PathBuf>,
    /// The files written.
    pub outputs: Vec<PathBuf>,
    /// The number of frames referencing an object.
    pub frames: usize,
    /// The number of results produced by the symbol backend in this
    /// run (as opposed to taken from the cache).
    pub symbolized: usize,
    /// The number of backend targets symbolized in this run.
    pub binaries: usize,
    /// All failures recorded.
    pub failures: Vec<FailureRecord>,
    /// The failure report written, if there were failures.
    pub failure_report: Option<PathBuf>,
    /// The wall clock time the run took.
    pub elapsed: Duration,
}


/// A log file to process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input {
    /// The path of the file.
    pub path: PathBuf,
    /// The path relative to the input it got found through.
    pub relative: PathBuf,
}


fn matches_extension(path: &Path, extension: Option<&str>) -> bool {
    match (extension, path.file_name()) {
        (None, _) => true,
        (Some(ext), Some(name)) => name.to_string_lossy().ends_with(ext),
        (Some(..), None) => false,
    }
}

fn scan_dir(base: &Path, dir: &Path, extension: Option<&str>, inputs: &mut Vec<Input>) -> Result<()> {
    let mut entries = read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read directory {}", dir.display()))?;
    let () = entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            let () = scan_dir(base, &path, extension, inputs)?;
        } else if path.is_file() && matches_extension(&path, extension) {
            let relative = path.strip_prefix(base).unwrap_or(&path).to_path_buf();
            let () = inputs.push(Input { path, relative });
        }
    }
    Ok(())
}

/// Collect the log files at `paths`.
///
/// Directories are scanned recursively, in file name order, and only
/// files with names ending in `extension` are picked up from them, if
/// provided. Files named explicitly are always used.
pub fn collect_inputs<P>(paths: &[P], extension: Option<&str>) -> Result<Vec<Input>>
where
    P: AsRef<Path>,
{
    let extension = extension.map(|ext| {
        if ext.starts_with('.') {
            ext.to_string()
        } else {
            format!(".{ext}")
        }
    });
    let extension = extension.as_deref();

    let mut inputs = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            let () = scan_dir(path, path, extension, &mut inputs)?;
        } else if path.is_file() {
            let relative = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| path.to_path_buf());
            let () = inputs.push(Input {
                path: path.to_path_buf(),
                relative,
            });
        } else {
            return Err(Error::with_not_found(format!(
                "input {} does not exist",
                path.display()
            )))
        }
    }
    Ok(inputs)
}


/// A parsed log file.
#[derive(Debug)]
struct Log {
    input: Input,
    text: String,
    parsed: ParsedLog,
}


/// A batch symbolizer of crash log files.
#[derive(Debug)]
pub struct Pipeline {
    resolver: Resolver,
    adapter: Adapter,
    scheduler: Scheduler,
    rewriters: usize,
    store: Option<Box<dyn CacheStore>>,
    extension: Option<String>,
    output: Output,
    failure_report: Option<PathBuf>,
}

impl Pipeline {
    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`Pipeline`].
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Retrieve the resolver in use, with the results memoized so far.
    #[inline]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    fn load_table(&self) -> SymbolTable {
        let mode = self.adapter.mode();
        match &self.store {
            Some(store) => match store.load(mode) {
                Ok(entries) => {
                    info!("loaded {} cached {mode} results", entries.len());
                    SymbolTable::new(entries)
                }
                Err(err) => {
                    warn!("failed to load cached results: {err:#}");
                    SymbolTable::default()
                }
            },
            None => SymbolTable::default(),
        }
    }

    fn write_merged(
        &self,
        dir: &Path,
        logs: &[Log],
        table: &SymbolTable,
    ) -> Result<(Vec<PathBuf>, Vec<FailureRecord>)> {
        let merge_one = |log: &Log| -> Result<(PathBuf, Vec<FailureRecord>)> {
            let merged = merge(&log.text, &log.parsed, table);
            let path = dir.join(&log.input.relative);
            if let Some(parent) = path.parent() {
                let () = create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
            let () = write(&path, merged.text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            debug!("wrote {}", path.display());

            let failures = merged
                .failures
                .into_iter()
                .map(|mut failure| {
                    failure.reason = format!("{}: {}", log.input.path.display(), failure.reason);
                    failure
                })
                .collect();
            Ok((path, failures))
        };

        let nthreads = self.rewriters.min(logs.len());
        let results = if nthreads <= 1 {
            logs.iter().map(merge_one).collect::<Vec<_>>()
        } else {
            thread::scope(|s| {
                let (job_tx, job_rx) = unbounded::<(usize, &Log)>();
                let (result_tx, result_rx) = unbounded();

                for _ in 0..nthreads {
                    let job_rx = job_rx.clone();
                    let result_tx = result_tx.clone();
                    let merge_one = &merge_one;
                    let _handle = s.spawn(move || {
                        while let Ok((idx, log)) = job_rx.recv() {
                            if result_tx.send((idx, merge_one(log))).is_err() {
                                break
                            }
                        }
                    });
                }
                drop(result_tx);

                for job in logs.iter().enumerate() {
                    let _result = job_tx.send(job);
                }
                drop(job_tx);

                let mut results = result_rx.iter().collect::<Vec<_>>();
                let () = results.sort_by_key(|(idx, _result)| *idx);
                results
                    .into_iter()
                    .map(|(_idx, result)| result)
                    .collect::<Vec<_>>()
            })
        };

        let mut outputs = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for result in results {
            let (path, merge_failures) = result?;
            let () = outputs.push(path);
            let () = failures.extend(merge_failures);
        }
        Ok((outputs, failures))
    }

    fn write_stacks(&self, path: &Path, logs: &[Log], table: &SymbolTable) -> Result<()> {
        let text = logs
            .iter()
            .map(|log| render_all(&log.parsed, table))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let () = create_dir_all(parent)
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
        }
        let () = write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn failure_report_path(&self) -> PathBuf {
        if let Some(path) = &self.failure_report {
            return path.clone()
        }

        match &self.output {
            Output::Merge(dir) => dir.join(FAILURE_REPORT_NAME),
            Output::Stacks(path) => path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(FAILURE_REPORT_NAME),
        }
    }

    /// Symbolize the crash logs at `paths`.
    ///
    /// Directories are scanned recursively. Errors are only reported
    /// for problems with inputs or outputs; everything going wrong
    /// during symbolization itself ends up in [`Report::failures`].
    #[cfg_attr(feature = "tracing", crate::log::instrument(skip_all))]
    pub fn run<P>(&mut self, paths: &[P]) -> Result<Report>
    where
        P: AsRef<Path>,
    {
        let start = Instant::now();
        let inputs = collect_inputs(paths, self.extension.as_deref())?;
        info!("processing {} log file(s)", inputs.len());

        let logs = inputs
            .into_iter()
            .map(|input| {
                let bytes = read(&input.path)
                    .with_context(|| format!("failed to read {}", input.path.display()))?;
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let parsed = parse(&text);
                Ok(Log {
                    input,
                    text,
                    parsed,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut table = self.load_table();
        let frames = logs
            .iter()
            .flat_map(|log| log.parsed.frames())
            .filter(|frame| frame.object.is_some())
            .count();

        let outcome = self.scheduler.schedule(
            logs.iter().flat_map(|log| log.parsed.frames()),
            &mut self.resolver,
            &self.adapter,
            &table,
        );
        let symbolized = outcome.fresh.len() + outcome.degraded.len();
        let binaries = outcome.binaries;
        let mut failures = outcome.failures;

        if let Some(store) = &mut self.store {
            if let Err(err) = store.save(self.adapter.mode(), &outcome.fresh) {
                warn!("failed to persist {} results: {err:#}", outcome.fresh.len());
            }
        }
        let () = table.extend(outcome.fresh);
        let () = table.extend(outcome.degraded);

        let outputs = match &self.output {
            Output::Merge(dir) => {
                let (outputs, merge_failures) = self.write_merged(dir, &logs, &table)?;
                let () = failures.extend(merge_failures);
                outputs
            }
            Output::Stacks(path) => {
                let () = self.write_stacks(path, &logs, &table)?;
                vec![path.clone()]
            }
        };

        let failure_report = if failures.is_empty() {
            None
        } else {
            let path = self.failure_report_path();
            let () = write_report(&path, &failures)?;
            Some(path)
        };

        let elapsed = start.elapsed();
        info!(
            "symbolized {symbolized} address(es) in {binaries} binary(ies) with {} failure(s) in {elapsed:?}",
            failures.len()
        );

        Ok(Report {
            inputs: logs.into_iter().map(|log| log.input.path).collect(),
            outputs,
            frames,
            symbolized,
            binaries,
            failures,
            failure_report,
            elapsed,
        })
    }
}
