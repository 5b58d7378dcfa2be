use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context as _;
use anyhow::Result;

use clap::ArgAction;
use clap::ArgGroup;
use clap::Args as Arguments;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;

use qss::backend::Flavor as BackendFlavor;


/// Parse a build ID from a string.
fn parse_build_id(s: &str) -> Result<String> {
    let build_id = s.trim().trim_start_matches("0x");
    if build_id.is_empty() || !build_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("invalid build ID: {s}")
    }
    Ok(build_id.to_ascii_lowercase())
}

/// Parse a worker count from a string.
fn parse_workers(s: &str) -> Result<usize> {
    s.parse::<usize>()
        .with_context(|| format!("failed to parse worker count: {s}"))
}


/// A command line interface for symbolizing crash logs against a root
/// file system.
#[derive(Debug, Parser)]
#[clap(version = env!("VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    /// Increase verbosity (can be supplied multiple times).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbosity: u8,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Symbolize the stack traces in one or more crash logs.
    Symbolize(Symbolize),
    /// List the objects referenced by crash logs along with their build
    /// IDs.
    Summary(Summary),
    /// Show how the debug binary for an object is found.
    Resolve(Resolve),
}


/// The `addr2line` implementation to use.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum Flavor {
    /// GNU binutils' `addr2line`.
    #[default]
    Gnu,
    /// LLVM's `llvm-addr2line`.
    Llvm,
}

impl From<Flavor> for BackendFlavor {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::Gnu => Self::Gnu,
            Flavor::Llvm => Self::Llvm,
        }
    }
}


/// Options controlling how debug binaries are looked up.
#[derive(Debug, Arguments)]
pub struct Lookup {
    /// A debug root inside the root file system, tried in the order
    /// given. Defaults to `/usr/lib/debug/.build-id`.
    #[clap(long = "debug-root", value_name = "PATH")]
    pub debug_roots: Vec<PathBuf>,
    /// Search the debug roots recursively for debug binaries with a
    /// matching file name.
    #[clap(long)]
    pub recursive_debug_search: bool,
}


/// A type representing the `symbolize` command.
#[derive(Debug, Arguments)]
#[clap(group = ArgGroup::new("destination").required(true).args(["merge_output", "output"]))]
pub struct Symbolize {
    /// The crash logs to symbolize. Directories are searched
    /// recursively.
    #[clap(required = true, value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,
    /// The root file system the crashed binaries came from.
    #[clap(long)]
    pub rootfs: PathBuf,
    #[command(flatten)]
    pub lookup: Lookup,
    /// The `addr2line` implementation to use.
    #[clap(long, value_enum, default_value_t = Flavor::Gnu)]
    pub flavor: Flavor,
    /// The path to the `addr2line` executable.
    #[clap(long = "addr2line", value_name = "EXE")]
    pub addr2line: Option<PathBuf>,
    /// A cross compilation prefix to prepend to the `addr2line`
    /// executable name (e.g., `aarch64-linux-gnu-`).
    #[clap(short = 'c', long = "cross-prefix", value_name = "PREFIX")]
    pub cross_prefix: Option<String>,
    /// The number of concurrent symbol backend invocations (0 to use
    /// one per CPU).
    #[clap(long, default_value = "0", value_parser = parse_workers)]
    pub workers_symbols: usize,
    /// The number of concurrent file rewrites (0 to use one per CPU).
    #[clap(long, default_value = "0", value_parser = parse_workers)]
    pub workers_rewrite: usize,
    /// Report inlined call chains.
    #[clap(long)]
    pub inline: bool,
    /// Do not demangle function names.
    #[clap(long)]
    pub no_demangle: bool,
    /// An SQLite database to persist symbolization results in.
    #[clap(long, value_name = "FILE")]
    pub cache_db: Option<PathBuf>,
    /// Only process files in input directories whose names end in this
    /// extension (e.g., `.log`).
    #[clap(long = "ext", value_name = "EXT")]
    pub extension: Option<String>,
    /// Write every input with its traces symbolized to the same
    /// relative path below this directory.
    #[clap(long, value_name = "DIR")]
    pub merge_output: Option<PathBuf>,
    /// Write only the symbolized traces of all inputs to this file.
    #[clap(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
    /// Where to append the report of failed symbolizations to.
    #[clap(long, value_name = "FILE")]
    pub failure_report: Option<PathBuf>,
}


/// A type representing the `summary` command.
#[derive(Debug, Arguments)]
pub struct Summary {
    /// The crash logs to inspect. Directories are searched recursively.
    #[clap(required = true, value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,
    /// The root file system to read build IDs from for objects the log
    /// has none for.
    #[clap(long)]
    pub rootfs: Option<PathBuf>,
    /// Compare build IDs from the logs against the binaries in the root
    /// file system.
    #[clap(long, requires = "rootfs")]
    pub check_mismatch: bool,
    /// Only inspect files in input directories whose names end in this
    /// extension (e.g., `.log`).
    #[clap(long = "ext", value_name = "EXT")]
    pub extension: Option<String>,
    /// Additionally write the summary as JSON to this file.
    #[clap(long, value_name = "FILE")]
    pub output_json: Option<PathBuf>,
}


/// A type representing the `resolve` command.
#[derive(Debug, Arguments)]
pub struct Resolve {
    /// The root file system the object came from.
    #[clap(long)]
    pub rootfs: PathBuf,
    /// The path of the object, as it appears in crash logs.
    pub object_path: String,
    /// The build ID of the object, as it appears in crash logs.
    #[clap(long, value_parser = parse_build_id)]
    pub build_id: Option<String>,
    #[command(flatten)]
    pub lookup: Lookup,
}
