//! Support for reading of GNU debug link data.
//!
//! From <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Separate-Debug-Files.html>:
//!
//! A debug link is a special section of the executable file named
//! .gnu_debuglink. The section must contain:
//! - A filename, with any leading directory components removed, followed by a
//!   zero byte,
//! - zero to three bytes of padding, as needed to reach the next four-byte
//!   boundary within the section, and
//! - a four-byte CRC checksum, stored in the same endianness used for the
//!   executable file itself.

use std::ffi::OsStr;

use crate::error::IntoError as _;
use crate::util::bytes_to_os_str;
use crate::util::ReadRaw as _;
use crate::Result;

use super::ElfParser;


/// The name of the section containing the debug link.
const DEBUG_LINK_SECTION: &str = ".gnu_debuglink";


/// A parsed debug link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DebugLink<'elf> {
    /// The file name of the linked debug file.
    pub file: &'elf OsStr,
    /// The checksum of the linked debug file's contents.
    pub crc: u32,
}


/// Read the debug link of an ELF file, if it has one.
pub(crate) fn read_debug_link(parser: &ElfParser) -> Result<Option<DebugLink<'_>>> {
    let idx = if let Some(idx) = parser.find_section(DEBUG_LINK_SECTION)? {
        idx
    } else {
        return Ok(None)
    };

    let data = parser.section_data(idx)?;
    parse_debug_link_section_data(data).map(Some)
}


fn parse_debug_link_section_data(mut data: &[u8]) -> Result<DebugLink<'_>> {
    let data_start = data;
    let file = data
        .read_cstr()
        .ok_or_invalid_data(|| "failed to read debug link file name")?;
    let file = bytes_to_os_str(file.to_bytes())?;

    // The checksum is aligned to the next four byte boundary relative
    // to the start of the section.
    let () = data.align_relative(data_start, 4).ok_or_invalid_data(|| {
        "debug link section contains insufficient data: checksum not found"
    })?;
    // TODO: The CRC value is in the same endianess as the ELF file
    //       itself. Once we support non-host endianesses we need to
    //       take that into account.
    let crc = data
        .read_u32()
        .ok_or_invalid_data(|| "failed to read debug link checksum")?;
    Ok(DebugLink { file, crc })
}
