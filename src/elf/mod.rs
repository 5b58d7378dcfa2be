//! Minimal ELF support: section lookup, GNU debug links, and build IDs.
//!
//! Everything beyond these facts (symbols, DWARF, ...) is left to the
//! symbol backend.

mod build_id;
mod debug_link;
mod parser;
pub(crate) mod types;

pub(crate) use build_id::read_build_id;
pub(crate) use debug_link::read_debug_link;
pub(crate) use parser::ElfParser;
