use std::mem::size_of;
use std::ops::Deref as _;
use std::path::Path;

use crate::mmap::Mmap;
use crate::util::Pod;
use crate::util::ReadRaw as _;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf32_Ehdr;
use super::types::Elf32_Shdr;
use super::types::Elf64_Ehdr;
use super::types::Elf64_Shdr;
use super::types::SectionHeader;
use super::types::EI_CLASS;
use super::types::EI_DATA;
use super::types::EI_NIDENT;
use super::types::ELFCLASS32;
use super::types::ELFCLASS64;
use super::types::ELFDATA2LSB;
use super::types::ELFDATA2MSB;
use super::types::SHN_XINDEX;
use super::types::SHT_NOBITS;


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Class {
    Elf32,
    Elf64,
}

/// The parts of the ELF header we care about, independent of class.
#[derive(Debug)]
struct Ehdr {
    class: Class,
    shoff: u64,
    shnum: u16,
    shstrndx: u16,
}


fn parse_ehdr(data: &[u8]) -> Result<Ehdr> {
    let ident = data
        .get(..EI_NIDENT)
        .ok_or_invalid_data(|| "file is too small to contain an ELF header")?;
    if ident[0..4] != *b"\x7fELF" {
        return Err(Error::with_invalid_data(format!(
            "encountered unexpected e_ident: {:x?}",
            &ident[0..4]
        )))
    }

    let host = if cfg!(target_endian = "little") {
        ELFDATA2LSB
    } else {
        ELFDATA2MSB
    };
    if ident[EI_DATA] != host {
        return Err(Error::new(
            ErrorKind::Unsupported,
            format!("ELF data encoding {} is not supported", ident[EI_DATA]),
        ))
    }

    let mut data = data;
    let ehdr = match ident[EI_CLASS] {
        ELFCLASS32 => {
            let ehdr = data
                .read_pod::<Elf32_Ehdr>()
                .ok_or_invalid_data(|| "failed to read Elf32_Ehdr")?;
            Ehdr {
                class: Class::Elf32,
                shoff: ehdr.e_shoff.into(),
                shnum: ehdr.e_shnum,
                shstrndx: ehdr.e_shstrndx,
            }
        }
        ELFCLASS64 => {
            let ehdr = data
                .read_pod::<Elf64_Ehdr>()
                .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
            Ehdr {
                class: Class::Elf64,
                shoff: ehdr.e_shoff,
                shnum: ehdr.e_shnum,
                shstrndx: ehdr.e_shstrndx,
            }
        }
        class => {
            return Err(Error::with_invalid_data(format!(
                "encountered unsupported ELF class {class}"
            )))
        }
    };
    Ok(ehdr)
}

fn read_shdrs<S>(data: &[u8], shoff: u64, count: usize) -> Result<Vec<SectionHeader>>
where
    S: Pod,
    for<'s> SectionHeader: From<&'s S>,
{
    let mut data = usize::try_from(shoff)
        .ok()
        .and_then(|shoff| data.get(shoff..))
        .ok_or_invalid_data(|| "e_shoff is invalid")?;
    let () = count
        .checked_mul(size_of::<S>())
        .and_then(|len| data.ensure(len))
        .ok_or_invalid_data(|| format!("ELF file is too small to hold {count} section headers"))?;

    (0..count)
        .map(|_| {
            data.read_pod::<S>()
                .map(|shdr| SectionHeader::from(&shdr))
                .ok_or_invalid_data(|| "failed to read section header")
        })
        .collect()
}

fn parse_shdrs(data: &[u8], ehdr: &Ehdr) -> Result<(Vec<SectionHeader>, usize)> {
    if ehdr.shoff == 0 {
        return Ok((Vec::new(), 0))
    }

    let read = |count| match ehdr.class {
        Class::Elf32 => read_shdrs::<Elf32_Shdr>(data, ehdr.shoff, count),
        Class::Elf64 => read_shdrs::<Elf64_Shdr>(data, ehdr.shoff, count),
    };

    // ELF contains a couple of clauses that special case data ranges
    // of certain header members to reference data from the very first
    // section header, which otherwise is zeroed out.
    let first = read(1)?
        .first()
        .copied()
        .ok_or_invalid_data(|| "failed to read first section header")?;

    // "If the number of entries in the section header table is larger than
    // or equal to SHN_LORESERVE, e_shnum holds the value zero and the real
    // number of entries in the section header table is held in the sh_size
    // member of the initial entry in section header table."
    let shnum = if ehdr.shnum == 0 {
        usize::try_from(first.size).ok().ok_or_invalid_data(|| {
            format!(
                "ELF file contains unsupported number of sections ({})",
                first.size
            )
        })?
    } else {
        usize::from(ehdr.shnum)
    };

    // "If the index of section name string table section is larger
    // than or equal to SHN_LORESERVE (0xff00), this member holds
    // SHN_XINDEX (0xffff) and the real index of the section name
    // string table section is held in the sh_link member of the
    // initial entry in section header table."
    let shstrndx = if ehdr.shstrndx == SHN_XINDEX {
        first.link
    } else {
        u32::from(ehdr.shstrndx)
    };
    let shstrndx = usize::try_from(shstrndx).ok().ok_or_invalid_data(|| {
        format!("ELF file contains unsupported section name string table index ({shstrndx})")
    })?;

    let shdrs = read(shnum)?;
    Ok((shdrs, shstrndx))
}


/// A minimal parser for ELF files, providing access to sections.
///
/// Both ELF classes are supported, as long as the data encoding
/// matches that of the host.
#[derive(Debug)]
pub(crate) struct ElfParser {
    /// The memory mapped file.
    mmap: Mmap,
    /// The section headers, in file order.
    shdrs: Vec<SectionHeader>,
    /// The index of the section name string table.
    shstrndx: usize,
}

impl ElfParser {
    /// Create an `ElfParser` for a path.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let mmap = Mmap::open(path)?;
        Self::from_mmap(mmap).with_context(|| format!("failed to parse ELF file {}", path.display()))
    }

    /// Create an `ElfParser` from mmap'ed data.
    pub(crate) fn from_mmap(mmap: Mmap) -> Result<Self> {
        let ehdr = parse_ehdr(mmap.deref())?;
        let (shdrs, shstrndx) = parse_shdrs(mmap.deref(), &ehdr)?;
        Ok(Self {
            mmap,
            shdrs,
            shstrndx,
        })
    }

    /// Retrieve all section headers.
    pub(crate) fn section_headers(&self) -> &[SectionHeader] {
        &self.shdrs
    }

    /// Retrieve the data corresponding to the ELF section at index `idx`.
    pub(crate) fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let section = self
            .shdrs
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))?;

        if section.type_ == SHT_NOBITS {
            return Ok(&[])
        }

        let data = usize::try_from(section.offset)
            .ok()
            .and_then(|offset| self.mmap.get(offset..))
            .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
            .read_slice(usize::try_from(section.size).unwrap_or(usize::MAX))
            .ok_or_invalid_data(|| "failed to read section data: invalid size")?;
        Ok(data)
    }

    /// Get the name of the section at a given index.
    pub(crate) fn section_name(&self, idx: usize) -> Result<&str> {
        let shstrtab = self.section_data(self.shstrndx)?;
        let section = self
            .shdrs
            .get(idx)
            .ok_or_invalid_input(|| "ELF section index out of bounds")?;
        let name = shstrtab
            .get(section.name as usize..)
            .ok_or_invalid_input(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_input(|| "no valid string found in string table")?
            .to_str()
            .map_err(Error::with_invalid_data)
            .context("invalid section name")?;
        Ok(name)
    }

    /// Find the section of a given name.
    ///
    /// This function return the index of the section if found.
    pub(crate) fn find_section(&self, name: &str) -> Result<Option<usize>> {
        for idx in 1..self.shdrs.len() {
            if self.section_name(idx)? == name {
                return Ok(Some(idx))
            }
        }
        Ok(None)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::write;
    use std::slice;

    use tempfile::tempdir;
    use tempfile::tempfile;
    use test_log::test;

    use std::io::Seek as _;
    use std::io::Write as _;

    use crate::elf::types::SHN_LORESERVE;
    use crate::elf::types::SHT_NOTE;
    use crate::test_helper::elf_with_sections;
    use crate::test_helper::ElfClass;


    fn parse(image: &[u8]) -> Result<ElfParser> {
        let mut file = tempfile().unwrap();
        let () = file.write_all(image).unwrap();
        let () = file.rewind().unwrap();
        ElfParser::from_mmap(Mmap::map(&file).unwrap())
    }

    /// Check that we can find sections by name in fabricated files of
    /// both classes.
    #[test]
    fn section_lookup() {
        for class in [ElfClass::Elf32, ElfClass::Elf64] {
            let image = elf_with_sections(
                class,
                &[
                    (".text", 1, b"\x90\x90\x90".as_slice()),
                    (".note.test", SHT_NOTE, b"abcd".as_slice()),
                ],
            );
            let parser = parse(&image).unwrap();
            assert_ne!(format!("{parser:?}"), "");

            let idx = parser.find_section(".note.test").unwrap().unwrap();
            assert_eq!(parser.section_name(idx).unwrap(), ".note.test");
            assert_eq!(parser.section_data(idx).unwrap(), b"abcd");
            assert_eq!(parser.section_headers()[idx].type_, SHT_NOTE);

            let idx = parser.find_section(".text").unwrap().unwrap();
            assert_eq!(parser.section_data(idx).unwrap(), b"\x90\x90\x90");

            assert_eq!(parser.find_section(".gnu_debuglink").unwrap(), None);
        }
    }

    /// Make sure that non-ELF files are rejected.
    #[test]
    fn non_elf_rejection() {
        let err = parse(b"#!/bin/sh\necho hello\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = parse(b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = parse(b"\x7fELF\x03\x01\x01\0\0\0\0\0\0\0\0\0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    /// Check that opening a file by path works and errors carry the path.
    #[test]
    fn open_by_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("libfoo.so");
        let image = elf_with_sections(ElfClass::Elf64, &[(".data", 1, b"xyz".as_slice())]);
        let () = write(&path, image).unwrap();
        let parser = ElfParser::open(&path).unwrap();
        assert!(parser.find_section(".data").unwrap().is_some());

        let path = dir.path().join("garbage");
        let () = write(&path, b"garbage garbage garbage").unwrap();
        let err = ElfParser::open(&path).unwrap_err();
        assert!(err.to_string().contains("garbage"), "{err}");
    }

    /// Check that our `ElfParser` can handle more than 0xff00 section
    /// headers properly.
    #[test]
    fn excessive_section_headers() {
        const SHNUM: u16 = (SHN_LORESERVE + 0x42) as _;

        #[repr(C)]
        struct Elf {
            ehdr: Elf64_Ehdr,
            shdrs: [Elf64_Shdr; 2],
        }

        let elf = Elf {
            ehdr: Elf64_Ehdr {
                e_ident: [127, 69, 76, 70, 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                e_type: 3,
                e_machine: 62,
                e_version: 1,
                e_entry: 4208,
                e_phoff: 0,
                e_shoff: size_of::<Elf64_Ehdr>() as _,
                e_flags: 0,
                e_ehsize: 64,
                e_phentsize: 56,
                e_phnum: 0,
                e_shentsize: 64,
                e_shnum: 0,
                e_shstrndx: 0,
            },
            shdrs: [
                Elf64_Shdr {
                    sh_name: 0,
                    sh_type: 0,
                    sh_flags: 0,
                    sh_addr: 0,
                    sh_offset: 0,
                    sh_size: SHNUM.into(),
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: 0,
                    sh_entsize: 0,
                },
                Elf64_Shdr {
                    sh_name: 0,
                    sh_type: 1,
                    sh_flags: 2,
                    sh_addr: 792,
                    sh_offset: 792,
                    sh_size: 28,
                    sh_link: 0,
                    sh_info: 0,
                    sh_addralign: 1,
                    sh_entsize: 0,
                },
            ],
        };

        // SAFETY: `Elf` is a plain `repr(C)` aggregate without padding.
        let dump =
            unsafe { slice::from_raw_parts((&elf as *const Elf).cast::<u8>(), size_of::<Elf>()) };
        if cfg!(target_endian = "big") {
            return
        }

        // The file claims way more section headers than it contains.
        let err = parse(dump).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains(&SHNUM.to_string()), "{err}");
    }

    /// Test that our `ElfParser` can handle a `shstrndx` larger than
    /// 0xff00.
    #[test]
    fn large_e_shstrndx() {
        const SHSTRNDX: u16 = (SHN_LORESERVE + 0x42) as _;

        #[repr(C)]
        struct Elf {
            ehdr: Elf64_Ehdr,
            shdrs: [Elf64_Shdr; 1],
        }

        let elf = Elf {
            ehdr: Elf64_Ehdr {
                e_ident: [127, 69, 76, 70, 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
                e_type: 3,
                e_machine: 62,
                e_version: 1,
                e_entry: 4208,
                e_phoff: 0,
                e_shoff: size_of::<Elf64_Ehdr>() as _,
                e_flags: 0,
                e_ehsize: 64,
                e_phentsize: 56,
                e_phnum: 0,
                e_shentsize: 64,
                e_shnum: 1,
                e_shstrndx: SHN_XINDEX,
            },
            shdrs: [Elf64_Shdr {
                sh_name: 0,
                sh_type: 0,
                sh_flags: 0,
                sh_addr: 0,
                sh_offset: 0,
                sh_size: 0,
                sh_link: SHSTRNDX.into(),
                sh_info: 0,
                sh_addralign: 0,
                sh_entsize: 0,
            }],
        };

        if cfg!(target_endian = "big") {
            return
        }

        // SAFETY: `Elf` is a plain `repr(C)` aggregate without padding.
        let dump =
            unsafe { slice::from_raw_parts((&elf as *const Elf).cast::<u8>(), size_of::<Elf>()) };
        let parser = parse(dump).unwrap();
        assert_eq!(parser.shstrndx, usize::from(SHSTRNDX));
        // The string table index is out of bounds, so name lookups fail
        // gracefully.
        assert!(parser.section_name(0).is_err());
    }
}
