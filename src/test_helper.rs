//! Helpers for fabricating ELF images in tests.

use crate::elf::types::NT_GNU_BUILD_ID;


#[derive(Clone, Copy, Debug)]
pub(crate) enum ElfClass {
    Elf32,
    Elf64,
}


fn pad_to(data: &mut Vec<u8>, align: usize) {
    while data.len() % align != 0 {
        let () = data.push(0);
    }
}

/// Create an ELF image (in host byte order) that contains the provided
/// sections, given as `(name, type, data)`, plus a section name string
/// table.
pub(crate) fn elf_with_sections(class: ElfClass, sections: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let (ehsize, shentsize) = match class {
        ElfClass::Elf32 => (52usize, 40usize),
        ElfClass::Elf64 => (64usize, 64usize),
    };

    let mut image = vec![0u8; ehsize];
    let mut shstrtab = vec![0u8];
    // (name offset, type, file offset, size)
    let mut shdrs = vec![(0u32, 0u32, 0u64, 0u64)];

    for (name, type_, data) in sections {
        let () = pad_to(&mut image, 4);
        let name_off = shstrtab.len() as u32;
        let () = shstrtab.extend_from_slice(name.as_bytes());
        let () = shstrtab.push(0);
        let () = shdrs.push((name_off, *type_, image.len() as u64, data.len() as u64));
        let () = image.extend_from_slice(data);
    }

    let name_off = shstrtab.len() as u32;
    let () = shstrtab.extend_from_slice(b".shstrtab\0");
    let () = shdrs.push((name_off, 3, image.len() as u64, shstrtab.len() as u64));
    let () = image.extend_from_slice(&shstrtab);

    let () = pad_to(&mut image, 8);
    let shoff = image.len() as u64;
    let shnum = shdrs.len() as u16;
    let shstrndx = shnum - 1;

    for (name, type_, offset, size) in shdrs {
        match class {
            ElfClass::Elf32 => {
                let fields = [name, type_, 0, 0, offset as u32, size as u32, 0, 0, 1, 0];
                for field in fields {
                    let () = image.extend_from_slice(&field.to_ne_bytes());
                }
            }
            ElfClass::Elf64 => {
                let () = image.extend_from_slice(&name.to_ne_bytes());
                let () = image.extend_from_slice(&type_.to_ne_bytes());
                let () = image.extend_from_slice(&0u64.to_ne_bytes());
                let () = image.extend_from_slice(&0u64.to_ne_bytes());
                let () = image.extend_from_slice(&offset.to_ne_bytes());
                let () = image.extend_from_slice(&size.to_ne_bytes());
                let () = image.extend_from_slice(&0u32.to_ne_bytes());
                let () = image.extend_from_slice(&0u32.to_ne_bytes());
                let () = image.extend_from_slice(&1u64.to_ne_bytes());
                let () = image.extend_from_slice(&0u64.to_ne_bytes());
            }
        }
    }

    let data = if cfg!(target_endian = "little") { 1 } else { 2 };
    let mut ehdr = Vec::with_capacity(ehsize);
    let () = ehdr.extend_from_slice(b"\x7fELF");
    let () = ehdr.push(match class {
        ElfClass::Elf32 => 1,
        ElfClass::Elf64 => 2,
    });
    let () = ehdr.extend_from_slice(&[data, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    // e_type, e_machine, e_version
    let () = ehdr.extend_from_slice(&3u16.to_ne_bytes());
    let () = ehdr.extend_from_slice(&0u16.to_ne_bytes());
    let () = ehdr.extend_from_slice(&1u32.to_ne_bytes());
    match class {
        ElfClass::Elf32 => {
            // e_entry, e_phoff, e_shoff, e_flags
            let () = ehdr.extend_from_slice(&0u32.to_ne_bytes());
            let () = ehdr.extend_from_slice(&0u32.to_ne_bytes());
            let () = ehdr.extend_from_slice(&(shoff as u32).to_ne_bytes());
            let () = ehdr.extend_from_slice(&0u32.to_ne_bytes());
        }
        ElfClass::Elf64 => {
            let () = ehdr.extend_from_slice(&0u64.to_ne_bytes());
            let () = ehdr.extend_from_slice(&0u64.to_ne_bytes());
            let () = ehdr.extend_from_slice(&shoff.to_ne_bytes());
            let () = ehdr.extend_from_slice(&0u32.to_ne_bytes());
        }
    }
    // e_ehsize, e_phentsize, e_phnum, e_shentsize, e_shnum, e_shstrndx
    let () = ehdr.extend_from_slice(&(ehsize as u16).to_ne_bytes());
    let () = ehdr.extend_from_slice(&0u16.to_ne_bytes());
    let () = ehdr.extend_from_slice(&0u16.to_ne_bytes());
    let () = ehdr.extend_from_slice(&(shentsize as u16).to_ne_bytes());
    let () = ehdr.extend_from_slice(&shnum.to_ne_bytes());
    let () = ehdr.extend_from_slice(&shstrndx.to_ne_bytes());
    assert_eq!(ehdr.len(), ehsize);

    let () = image[..ehsize].copy_from_slice(&ehdr);
    image
}

/// Create the contents of a GNU build ID note section.
pub(crate) fn build_id_note(build_id: &[u8]) -> Vec<u8> {
    let mut note = Vec::new();
    let () = note.extend_from_slice(&4u32.to_ne_bytes());
    let () = note.extend_from_slice(&(build_id.len() as u32).to_ne_bytes());
    let () = note.extend_from_slice(&NT_GNU_BUILD_ID.to_ne_bytes());
    let () = note.extend_from_slice(b"GNU\0");
    let () = note.extend_from_slice(build_id);
    let () = pad_to(&mut note, 4);
    note
}

/// Create the contents of a `.gnu_debuglink` section.
pub(crate) fn debug_link_section(file: &str, crc: u32) -> Vec<u8> {
    let mut data = Vec::new();
    let () = data.extend_from_slice(file.as_bytes());
    let () = data.push(0);
    let () = pad_to(&mut data, 4);
    let () = data.extend_from_slice(&crc.to_ne_bytes());
    data
}
