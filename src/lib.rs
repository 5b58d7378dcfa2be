#![doc = include_str!("../README.md")]
#![allow(clippy::let_and_return, clippy::let_unit_value)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::absolute_paths,
    rustdoc::broken_intra_doc_links
)]

pub mod backend;
pub mod cache;
mod elf;
mod error;
pub mod failure;
mod log;
pub mod merge;
mod mmap;
pub mod parse;
pub mod pipeline;
pub mod render;
pub mod resolve;
pub mod schedule;
pub mod summary;
#[cfg(test)]
mod test_helper;
mod util;

use serde::Deserialize;
use serde::Serialize;

pub use crate::backend::Mode;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoCowStr;
pub use crate::error::IntoError;
pub use crate::error::Result;
pub use crate::util::normalize_hex;


/// The function name reported for unknown code.
pub const UNKNOWN_FUNCTION: &str = "??";
/// The location reported for unknown code.
pub const UNKNOWN_LOCATION: &str = "??:0";


/// A single `(function, location)` pair of a symbolization result.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SymbolEntry {
    /// The function name.
    pub function: String,
    /// The source location, typically `<file>:<line>`.
    pub location: String,
}

impl SymbolEntry {
    /// Create a new `SymbolEntry`.
    pub fn new<F, L>(function: F, location: L) -> Self
    where
        F: Into<String>,
        L: Into<String>,
    {
        Self {
            function: function.into(),
            location: location.into(),
        }
    }

    /// Create the entry used for code that could not be symbolized.
    #[inline]
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_FUNCTION, UNKNOWN_LOCATION)
    }

    /// Check whether the location of this entry is unknown.
    ///
    /// Backends spell an unknown location in a few different ways
    /// (`??:0`, `?:0`, `??:?`, ...).
    pub fn has_unknown_location(&self) -> bool {
        let location = self.location.as_str();
        location.is_empty() || location == "?:0" || location.starts_with("??")
    }
}


/// The symbolization result for a single address.
///
/// The list holds one entry per (inlined) function, innermost first. It
/// is never empty: an address that could not be resolved is represented
/// by a single [unknown][SymbolEntry::unknown] entry.
///
/// In serialized form the result is a list of `[function, location]`
/// pairs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "Vec<(String, String)>", into = "Vec<(String, String)>")]
pub struct SymbolInfo(Vec<SymbolEntry>);

impl SymbolInfo {
    /// Create a `SymbolInfo` from a list of entries.
    ///
    /// An empty list results in an unknown symbol.
    pub fn new(entries: Vec<SymbolEntry>) -> Self {
        if entries.is_empty() {
            Self::unknown()
        } else {
            Self(entries)
        }
    }

    /// Create the `SymbolInfo` for an address that could not be
    /// resolved.
    #[inline]
    pub fn unknown() -> Self {
        Self(vec![SymbolEntry::unknown()])
    }

    /// Retrieve the entries, innermost first.
    #[inline]
    pub fn entries(&self) -> &[SymbolEntry] {
        &self.0
    }

    /// Retrieve the innermost entry.
    #[inline]
    pub fn first(&self) -> &SymbolEntry {
        // The list is never empty.
        &self.0[0]
    }

    /// Check whether this is a result without any information.
    pub fn is_unknown(&self) -> bool {
        self.0
            .iter()
            .all(|entry| entry.function == UNKNOWN_FUNCTION && entry.has_unknown_location())
    }

    /// Apply `f` to every function name.
    pub(crate) fn map_functions<F>(self, mut f: F) -> Self
    where
        F: FnMut(String) -> String,
    {
        Self(
            self.0
                .into_iter()
                .map(|entry| SymbolEntry {
                    function: f(entry.function),
                    location: entry.location,
                })
                .collect(),
        )
    }
}

impl Default for SymbolInfo {
    #[inline]
    fn default() -> Self {
        Self::unknown()
    }
}

impl From<Vec<(String, String)>> for SymbolInfo {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(function, location)| SymbolEntry { function, location })
                .collect(),
        )
    }
}

impl From<SymbolInfo> for Vec<(String, String)> {
    fn from(info: SymbolInfo) -> Self {
        info.0
            .into_iter()
            .map(|entry| (entry.function, entry.location))
            .collect()
    }
}
