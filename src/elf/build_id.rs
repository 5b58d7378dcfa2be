use crate::log::warn;
use crate::util::ReadRaw as _;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf_Nhdr;
use super::types::NT_GNU_BUILD_ID;
use super::types::SHT_NOTE;
use super::ElfParser;


/// The name of the section conventionally holding the build ID note.
const BUILD_ID_SECTION: &str = ".note.gnu.build-id";


/// Iterate over the notes contained in note section data, looking for
/// a GNU build ID.
fn find_build_id_note(section: &[u8]) -> Result<Option<&[u8]>> {
    let mut data = section;
    while !data.is_empty() {
        let header = data
            .read_pod::<Elf_Nhdr>()
            .ok_or_invalid_data(|| "failed to read ELF note header")?;
        let name = data
            .read_slice(header.n_namesz as usize)
            .ok_or_invalid_data(|| "failed to read ELF note name")?;
        let () = data
            .align_relative(section, 4)
            .ok_or_invalid_data(|| "ELF note name is not properly padded")?;
        let desc = data
            .read_slice(header.n_descsz as usize)
            .ok_or_invalid_data(|| "failed to read ELF note descriptor")?;
        // The last note in a section may lack padding.
        if data.align_relative(section, 4).is_none() {
            data = &[];
        }

        if header.n_type == NT_GNU_BUILD_ID {
            if name == b"GNU\0" {
                return Ok(Some(desc))
            }
            warn!("encountered unsupported build ID note name {name:?}; ignoring");
        }
    }
    Ok(None)
}

/// Attempt to read an ELF binary's build ID.
///
/// The `.note.gnu.build-id` section is consulted first, followed by
/// all other note sections.
pub(crate) fn read_build_id(parser: &ElfParser) -> Result<Option<Vec<u8>>> {
    let named = parser.find_section(BUILD_ID_SECTION)?;
    if let Some(idx) = named {
        let type_ = parser.section_headers()[idx].type_;
        if type_ == SHT_NOTE {
            if let Some(build_id) = find_build_id_note(parser.section_data(idx)?)? {
                return Ok(Some(build_id.to_vec()))
            }
        } else {
            warn!("build ID section {BUILD_ID_SECTION} is of unsupported type ({type_})");
        }
    }

    for (idx, shdr) in parser.section_headers().iter().enumerate() {
        if shdr.type_ != SHT_NOTE || Some(idx) == named {
            continue
        }
        if let Some(build_id) = find_build_id_note(parser.section_data(idx)?)? {
            return Ok(Some(build_id.to_vec()))
        }
    }
    Ok(None)
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::write;

    use tempfile::tempdir;
    use test_log::test;

    use crate::test_helper::build_id_note;
    use crate::test_helper::elf_with_sections;
    use crate::test_helper::ElfClass;


    const BUILD_ID: [u8; 8] = [0xaa, 0x0d, 0x6e, 0x00, 0x11, 0x22, 0x33, 0x44];


    fn parser_for(sections: &[(&str, u32, &[u8])]) -> ElfParser {
        let dir = tempdir().unwrap();
        let path = dir.path().join("elf");
        let () = write(&path, elf_with_sections(ElfClass::Elf64, sections)).unwrap();
        // The mapping stays valid after the file got removed.
        ElfParser::open(&path).unwrap()
    }

    /// Check that we can read a binary's build ID based on the ELF
    /// section name as well as ELF section type.
    #[test]
    fn build_id_reading_from_name_and_notes() {
        let note = build_id_note(&BUILD_ID);

        let parser = parser_for(&[(BUILD_ID_SECTION, SHT_NOTE, note.as_slice())]);
        assert_eq!(read_build_id(&parser).unwrap().unwrap(), BUILD_ID);

        let parser = parser_for(&[(".note.other", SHT_NOTE, note.as_slice())]);
        assert_eq!(read_build_id(&parser).unwrap().unwrap(), BUILD_ID);
    }

    /// Check that a build ID note following other notes is found.
    #[test]
    fn build_id_after_other_notes() {
        let mut notes = Vec::new();
        // An ABI tag note, with a five byte name to exercise padding.
        let () = notes.extend_from_slice(&5u32.to_ne_bytes());
        let () = notes.extend_from_slice(&4u32.to_ne_bytes());
        let () = notes.extend_from_slice(&1u32.to_ne_bytes());
        let () = notes.extend_from_slice(b"ABCD\0\0\0\0");
        let () = notes.extend_from_slice(&[1, 2, 3, 4]);
        let () = notes.extend_from_slice(&build_id_note(&BUILD_ID));

        let parser = parser_for(&[(".note", SHT_NOTE, notes.as_slice())]);
        assert_eq!(read_build_id(&parser).unwrap().unwrap(), BUILD_ID);
    }

    /// Make sure that binaries without build ID are reported as such.
    #[test]
    fn missing_build_id() {
        let parser = parser_for(&[(".text", 1, b"\xc3".as_slice())]);
        assert_eq!(read_build_id(&parser).unwrap(), None);

        let parser = parser_for(&[(BUILD_ID_SECTION, 1, b"garbage!".as_slice())]);
        assert_eq!(read_build_id(&parser).unwrap(), None);
    }
}
