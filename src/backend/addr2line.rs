//! A [`SymbolBackend`] based on an external `addr2line` compatible
//! executable.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::thread;

use crate::log::debug;
use crate::log::trace;
use crate::util::normalize_hex;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;
use crate::SymbolEntry;
use crate::SymbolInfo;
use crate::UNKNOWN_FUNCTION;
use crate::UNKNOWN_LOCATION;

use super::SymbolBackend;


/// The `addr2line` implementation in use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flavor {
    /// GNU binutils' `addr2line`.
    #[default]
    Gnu,
    /// LLVM's `llvm-addr2line`.
    Llvm,
}

impl Flavor {
    fn default_executable(self) -> &'static str {
        match self {
            Self::Gnu => "addr2line",
            Self::Llvm => "llvm-addr2line",
        }
    }
}


/// A builder for [`Addr2Line`] objects.
///
/// By default the GNU flavor is used, with the executable looked up in
/// `PATH` and demangling enabled.
#[derive(Clone, Debug)]
pub struct Builder {
    flavor: Flavor,
    executable: Option<PathBuf>,
    cross_prefix: Option<String>,
    demangle: bool,
}

impl Builder {
    /// Set the `addr2line` flavor.
    pub fn set_flavor(mut self, flavor: Flavor) -> Builder {
        self.flavor = flavor;
        self
    }

    /// Set the executable to use.
    ///
    /// With the LLVM flavor, a plain `addr2line` is interpreted as
    /// `llvm-addr2line`.
    pub fn set_executable<P>(mut self, executable: Option<P>) -> Builder
    where
        P: Into<PathBuf>,
    {
        self.executable = executable.map(Into::into);
        self
    }

    /// Set a cross toolchain prefix such as `aarch64-linux-gnu-`.
    ///
    /// With the GNU flavor, a prefix selects `<prefix>addr2line` as
    /// the executable, taking precedence over
    /// [`set_executable`](Self::set_executable).
    pub fn set_cross_prefix<S>(mut self, prefix: Option<S>) -> Builder
    where
        S: Into<String>,
    {
        self.cross_prefix = prefix.map(Into::into);
        self
    }

    /// Enable/disable demangling of C++ names by the tool (`-C`).
    pub fn enable_demangling(mut self, enable: bool) -> Builder {
        self.demangle = enable;
        self
    }

    /// Create the [`Addr2Line`] object.
    pub fn build(self) -> Addr2Line {
        let Builder {
            flavor,
            executable,
            cross_prefix,
            demangle,
        } = self;

        let executable = match (flavor, executable, cross_prefix) {
            (Flavor::Gnu, _, Some(prefix)) if !prefix.is_empty() => {
                PathBuf::from(format!("{prefix}addr2line"))
            }
            (Flavor::Llvm, Some(executable), _) if executable == Path::new("addr2line") => {
                PathBuf::from(Flavor::Llvm.default_executable())
            }
            (_, Some(executable), _) => executable,
            (flavor, None, _) => PathBuf::from(flavor.default_executable()),
        };

        Addr2Line {
            executable,
            demangle,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            flavor: Flavor::default(),
            executable: None,
            cross_prefix: None,
            demangle: true,
        }
    }
}


/// Check whether a line is an address echoed by `addr2line -a`.
fn is_address_line(line: &str) -> bool {
    line.strip_prefix("0x")
        .map(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn function_name(name: &str) -> String {
    match name {
        "" | "???" => UNKNOWN_FUNCTION.to_string(),
        name => name.to_string(),
    }
}

fn location(location: &str) -> String {
    match location {
        "" | "??" => UNKNOWN_LOCATION.to_string(),
        location => location.to_string(),
    }
}

/// Parse the output of `addr2line -a -f [-i]` into blocks of
/// `(echoed address, entries)`.
///
/// Each block starts with the echoed address line and contains
/// function/location line pairs. Content before the first address line
/// is ignored.
fn parse_output(output: &str) -> Vec<(String, Vec<SymbolEntry>)> {
    let mut blocks = Vec::<(String, Vec<SymbolEntry>)>::new();
    let mut lines = output.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        if is_address_line(line) {
            let () = blocks.push((line.to_string(), Vec::new()));
            continue
        }

        let entries = match blocks.last_mut() {
            Some((_addr, entries)) => entries,
            None => {
                trace!("ignoring unexpected addr2line output line `{line}`");
                continue
            }
        };

        // A location line never looks like an address, so a missing one
        // does not swallow the next block's header.
        let loc = match lines.peek() {
            Some(next) if !is_address_line(next) => lines.next().unwrap_or_default(),
            _ => "",
        };
        let () = entries.push(SymbolEntry::new(function_name(line), location(loc)));
    }
    blocks
}

/// Match parsed output blocks to the requested addresses.
///
/// Blocks are matched by normalized address. If that fails for an
/// address and the block count equals the address count, the block at
/// the same position is used.
fn match_blocks(addrs: &[String], blocks: Vec<(String, Vec<SymbolEntry>)>) -> Vec<SymbolInfo> {
    let positional = blocks.len() == addrs.len();
    let mut by_addr = HashMap::<String, Vec<SymbolEntry>>::new();
    let mut in_order = Vec::with_capacity(blocks.len());

    for (addr, entries) in blocks {
        let () = in_order.push(entries.clone());
        let () = by_addr
            .entry(normalize_hex(&addr).into_owned())
            .or_default()
            .extend(entries);
    }

    addrs
        .iter()
        .enumerate()
        .map(|(idx, addr)| {
            let entries = by_addr
                .get(&*normalize_hex(addr))
                .cloned()
                .or_else(|| positional.then(|| in_order[idx].clone()))
                .unwrap_or_default();
            SymbolInfo::new(entries)
        })
        .collect()
}


/// A [`SymbolBackend`] running an `addr2line` compatible executable.
///
/// The executable is invoked as
/// `<exe> -a -f [-C] [-i] -e <debug binary or binary>`, with the
/// addresses fed on standard input.
#[derive(Clone, Debug)]
pub struct Addr2Line {
    executable: PathBuf,
    demangle: bool,
}

impl Addr2Line {
    /// Retrieve a [`Builder`] for configurable construction of an
    /// [`Addr2Line`] object.
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The executable in use.
    #[inline]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Check that the executable can be run, returning the first line
    /// of its version information.
    pub fn probe(&self) -> Result<String> {
        let output = Command::new(&self.executable)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.executable.display()))?;

        if !output.status.success() {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "{} --version exited with {}",
                    self.executable.display(),
                    output.status
                ),
            ))
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.lines().next().unwrap_or_default().trim().to_string();
        Ok(version)
    }

    fn command(&self, target: &Path, inline: bool) -> Command {
        let mut command = Command::new(&self.executable);
        let _command = command.arg("-a").arg("-f");
        if self.demangle {
            let _command = command.arg("-C");
        }
        if inline {
            let _command = command.arg("-i");
        }
        let _command = command
            .arg("-e")
            .arg(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn run(&self, target: &Path, addrs: &[String], inline: bool) -> Result<String> {
        let mut child = self
            .command(target, inline)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.executable.display()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_invalid_data(|| "child process has no standard input")?;

        let mut input = addrs.join("\n");
        let () = input.push('\n');

        // Feed input concurrently, so that neither side blocks on a full
        // pipe.
        let (output, written) = thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(input.as_bytes()));
            let output = child.wait_with_output();
            (output, writer.join())
        });

        let output = output
            .with_context(|| format!("failed to wait for {}", self.executable.display()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    self.executable.display(),
                    output.status,
                    stderr.trim()
                ),
            ))
        }

        let () = written
            .map_err(|_panic| Error::new(ErrorKind::Other, "address writer thread panicked"))?
            .context("failed to write addresses")?;

        let stdout = String::from_utf8(output.stdout)
            .map_err(Error::with_invalid_data)
            .with_context(|| format!("{} produced invalid output", self.executable.display()))?;
        Ok(stdout)
    }
}

impl SymbolBackend for Addr2Line {
    fn symbolize(
        &self,
        binary: &Path,
        debug_binary: Option<&Path>,
        addrs: &[String],
        inline: bool,
    ) -> Result<Vec<SymbolInfo>> {
        if addrs.is_empty() {
            return Ok(Vec::new())
        }

        let target = debug_binary.unwrap_or(binary);
        debug!(
            "running {} on {} for {} addresses",
            self.executable.display(),
            target.display(),
            addrs.len()
        );
        let output = self.run(target, addrs, inline)?;
        let blocks = parse_output(&output);
        Ok(match_blocks(addrs, blocks))
    }
}
