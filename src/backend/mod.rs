//! Symbolization of addresses by means of a symbol backend.
//!
//! A [`SymbolBackend`] turns addresses (file offsets) inside a binary
//! into [`SymbolInfo`] objects. The [`Adapter`] wraps a backend and
//! takes care of invocation granularity ([`Mode`]), matching of results
//! to addresses, demangling, and failure handling: a failing backend
//! never results in an error, only in unknown symbols and a recorded
//! reason.

mod addr2line;

use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::path::Path;
use std::slice;
use std::str::FromStr;

use crate::log::debug;
use crate::log::warn;
use crate::resolve::ResolvedTarget;
use crate::util::normalize_hex;
use crate::Error;
use crate::Result;
use crate::SymbolInfo;

pub use self::addr2line::Addr2Line;
pub use self::addr2line::Builder as Addr2LineBuilder;
pub use self::addr2line::Flavor;


/// The granularity with which the symbol backend is invoked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A single invocation for all addresses of a binary, without
    /// inline expansion.
    #[default]
    Batched,
    /// One invocation per address, with inlined call chains expanded.
    Inline,
}

impl Mode {
    /// The textual representation of the mode, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batched => "batched",
            Self::Inline => "inline",
        }
    }

    /// Check whether inlined functions are expanded in this mode.
    #[inline]
    pub fn is_inline(self) -> bool {
        self == Self::Inline
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batched" => Ok(Self::Batched),
            "inline" => Ok(Self::Inline),
            _ => Err(Error::with_invalid_input(format!(
                "invalid symbolization mode `{s}`"
            ))),
        }
    }
}


/// The interface to an entity able to symbolize addresses.
pub trait SymbolBackend
where
    Self: Debug + Send + Sync,
{
    /// Symbolize `addrs` (normalized hex file offsets) in `binary`,
    /// using `debug_binary` for debug information if provided.
    ///
    /// The result is positional: entry `i` belongs to `addrs[i]`. With
    /// `inline` set, inlined call chains are expanded, innermost first.
    fn symbolize(
        &self,
        binary: &Path,
        debug_binary: Option<&Path>,
        addrs: &[String],
        inline: bool,
    ) -> Result<Vec<SymbolInfo>>;
}


/// The results for a set of addresses of one binary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressResults {
    /// The symbol information, keyed by normalized address. Every
    /// requested address has an entry.
    pub symbols: HashMap<String, SymbolInfo>,
    /// The reason for degraded results, if any.
    pub failure: Option<String>,
}

impl AddressResults {
    fn unknown<S>(addrs: &[String], reason: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            symbols: addrs
                .iter()
                .map(|addr| (addr.clone(), SymbolInfo::unknown()))
                .collect(),
            failure: Some(reason.into()),
        }
    }
}


#[cfg(feature = "demangle")]
fn demangle_name(name: String) -> String {
    if !(name.starts_with("_Z") || name.starts_with("_R")) {
        return name
    }

    if let Ok(demangled) = rustc_demangle::try_demangle(&name) {
        return format!("{demangled:#}")
    }

    cpp_demangle::Symbol::new(name.as_bytes())
        .ok()
        .and_then(|symbol| symbol.demangle(&cpp_demangle::DemangleOptions::default()).ok())
        .unwrap_or(name)
}

#[cfg(not(feature = "demangle"))]
fn demangle_name(name: String) -> String {
    name
}


/// An adapter invoking a [`SymbolBackend`] in a given [`Mode`].
#[derive(Debug)]
pub struct Adapter {
    backend: Box<dyn SymbolBackend>,
    mode: Mode,
    demangle: bool,
}

impl Adapter {
    /// Create a new `Adapter`, with demangling enabled.
    pub fn new(backend: Box<dyn SymbolBackend>, mode: Mode) -> Self {
        Self {
            backend,
            mode,
            demangle: true,
        }
    }

    /// Enable/disable demangling of names the backend reported in
    /// mangled form.
    ///
    /// Demangling requires the `demangle` feature.
    pub fn set_demangle(mut self, demangle: bool) -> Self {
        self.demangle = demangle;
        self
    }

    /// The mode the backend is invoked in.
    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Symbolize `addrs` in the binaries described by `target`.
    ///
    /// Addresses are matched by their normalized representation. This
    /// method never fails. Addresses that could not be symbolized map
    /// to an unknown [`SymbolInfo`], and `failure` describes why.
    pub fn resolve_addresses(&self, target: &ResolvedTarget, addrs: &[String]) -> AddressResults {
        let addrs = addrs
            .iter()
            .map(|addr| normalize_hex(addr).into_owned())
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return AddressResults::default()
        }

        let file = target.backend_target();
        if !file.is_file() {
            return AddressResults::unknown(
                &addrs,
                format!("backend target {} does not exist", file.display()),
            )
        }

        let binary = &target.real_binary_path;
        let debug_binary = target.debug_binary_path.as_deref();
        let mut results = match self.mode {
            Mode::Batched => self.resolve_batched(binary, debug_binary, &addrs),
            Mode::Inline => self.resolve_inline(binary, debug_binary, &addrs),
        };

        if self.demangle {
            results.symbols = results
                .symbols
                .into_iter()
                .map(|(addr, info)| (addr, info.map_functions(demangle_name)))
                .collect();
        }
        results
    }

    fn resolve_batched(
        &self,
        binary: &Path,
        debug_binary: Option<&Path>,
        addrs: &[String],
    ) -> AddressResults {
        let infos = match self.backend.symbolize(binary, debug_binary, addrs, false) {
            Ok(infos) => infos,
            Err(err) => {
                warn!("failed to symbolize addresses in {}: {err:#}", binary.display());
                return AddressResults::unknown(addrs, format!("{err:#}"))
            }
        };

        let failure = (infos.len() != addrs.len()).then(|| {
            let reason = format!(
                "symbol backend returned {} results for {} addresses",
                infos.len(),
                addrs.len()
            );
            warn!("{reason}");
            reason
        });

        let mut infos = infos.into_iter();
        let symbols = addrs
            .iter()
            .map(|addr| (addr.clone(), infos.next().unwrap_or_default()))
            .collect();
        AddressResults { symbols, failure }
    }

    fn resolve_inline(
        &self,
        binary: &Path,
        debug_binary: Option<&Path>,
        addrs: &[String],
    ) -> AddressResults {
        let mut failures = Vec::new();
        let symbols = addrs
            .iter()
            .map(|addr| {
                let result = self.backend.symbolize(
                    binary,
                    debug_binary,
                    slice::from_ref(addr),
                    true,
                );
                let info = match result {
                    Ok(infos) => infos.into_iter().next().unwrap_or_default(),
                    Err(err) => {
                        debug!("failed to symbolize {addr} in {}: {err:#}", binary.display());
                        let () = failures.push(format!("{addr}: {err:#}"));
                        SymbolInfo::unknown()
                    }
                };
                (addr.clone(), info)
            })
            .collect();

        let failure = (!failures.is_empty()).then(|| failures.join("; "));
        AddressResults { symbols, failure }
    }
}
