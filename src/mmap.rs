use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap as Mapping;
use memmap2::MmapOptions;

use crate::Error;
use crate::ErrorExt as _;
use crate::Result;


/// A read-only memory mapping of an entire file.
///
/// Empty files are supported and yield an empty slice.
#[derive(Debug)]
pub(crate) struct Mmap {
    /// The actual memory mapping, if the file was not empty.
    mapping: Option<Mapping>,
}

impl Mmap {
    /// Memory map the file at the provided `path`.
    pub(crate) fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        Self::map(&file).with_context(|| format!("failed to memory map {}", path.display()))
    }

    /// Map the provided file into memory, in its entirety.
    pub(crate) fn map(file: &File) -> Result<Self> {
        let len = usize::try_from(file.metadata()?.len())
            .map_err(Error::with_invalid_data)
            .context("file is too large to mmap")?;

        // The kernel does not allow mmap'ing a region of size 0. We
        // want to enable this case transparently, though.
        let mapping = if len == 0 {
            None
        } else {
            // SAFETY: The mapping is read-only. Concurrent modification
            //         of rootfs content is not supported.
            let mapping = unsafe { MmapOptions::new().len(len).map(file) }?;
            Some(mapping)
        };
        Ok(Self { mapping })
    }
}

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.mapping.as_deref().unwrap_or(&[])
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::CStr;
    use std::io::Write;

    use tempfile::NamedTempFile;
    use test_log::test;

    use crate::util::ReadRaw;
    use crate::ErrorKind;


    /// Check that we can `mmap` an empty file.
    #[test]
    fn mmap_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let mmap = Mmap::map(file.as_file()).unwrap();
        assert_eq!(mmap.deref(), &[] as &[u8]);
    }

    /// Check that we can `mmap` a file by path.
    #[test]
    fn mmap_path() {
        let mut file = NamedTempFile::new().unwrap();
        let cstr = b"libfoo.so.debug\0";
        let () = file.write_all(cstr).unwrap();
        let () = file.as_file().sync_all().unwrap();

        let mmap = Mmap::open(file.path()).unwrap();
        let mut data = mmap.deref();
        let s = data.read_cstr().unwrap();
        assert_eq!(s, CStr::from_bytes_with_nul(cstr).unwrap());
    }

    /// Check that mapping a missing file reports the path.
    #[test]
    fn mmap_missing_file() {
        let err = Mmap::open("/does-not-exist/libfoo.so").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("/does-not-exist/libfoo.so"), "{err}");
    }
}
