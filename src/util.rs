use std::borrow::Cow;
use std::ffi::CStr;
use std::ffi::OsStr;
use std::mem::size_of;

#[cfg(not(unix))]
use crate::Error;
use crate::Result;


/// Convert a byte slice into an [`OsStr`].
#[cfg(unix)]
pub(crate) fn bytes_to_os_str(bytes: &[u8]) -> Result<&OsStr> {
    use std::os::unix::ffi::OsStrExt as _;

    Ok(OsStr::from_bytes(bytes))
}

/// Convert a byte slice into an [`OsStr`].
#[cfg(not(unix))]
pub(crate) fn bytes_to_os_str(bytes: &[u8]) -> Result<&OsStr> {
    use std::str;

    Ok(OsStr::new(str::from_utf8(bytes).map_err(Error::with_invalid_data)?))
}


/// Normalize the textual representation of a hexadecimal number.
///
/// The result is `0x` followed by lower case hex digits without leading
/// zeros (`0x0` for zero). `0x1A`, `1a`, and `0x01a` all map to `0x1a`.
/// Surrounding white space is ignored. An empty input maps to an empty
/// string.
pub fn normalize_hex(text: &str) -> Cow<'_, str> {
    let text = text.trim();
    if text.is_empty() {
        return Cow::Borrowed("")
    }

    let body = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let body = body.trim_start_matches('0');
    let body = if body.is_empty() { "0" } else { body };

    if text.len() == body.len() + 2
        && text.starts_with("0x")
        && !body.bytes().any(|b| b.is_ascii_uppercase())
    {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("0x{}", body.to_ascii_lowercase()))
    }
}

/// Format a byte string (such as a build ID) as lower case hex.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let () = s.push_str(&format!("{b:02x}"));
        s
    })
}


/// A marker trait for "plain old data" data types.
///
/// # Safety
/// Only safe to implement for types that are valid for any bit pattern.
pub(crate) unsafe trait Pod {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}

/// An trait providing utility functions for reading data from a byte buffer.
pub(crate) trait ReadRaw<'data> {
    /// Ensure that `len` bytes are available for consumption.
    fn ensure(&self, len: usize) -> Option<()>;

    /// Skip `len` bytes.
    fn advance(&mut self, len: usize) -> Option<()>;

    /// Align the read pointer relative to `base`, the start of the
    /// surrounding buffer, to the next multiple of `align_to`.
    fn align_relative(&mut self, base: &'data [u8], align_to: usize) -> Option<()>;

    /// Consume and return `len` bytes.
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]>;

    /// Read a NUL terminated string.
    fn read_cstr(&mut self) -> Option<&'data CStr>;

    /// Read anything implementing `Pod`.
    #[inline]
    fn read_pod<T>(&mut self) -> Option<T>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>())?;
        // SAFETY: `T` is `Pod` and hence valid for any bit pattern. The pointer
        //         is guaranteed to be valid and to point to memory of at least
        //         `sizeof(T)` bytes.
        let value = unsafe { data.as_ptr().cast::<T>().read_unaligned() };
        Some(value)
    }

    /// Read a `u32` value.
    #[inline]
    fn read_u32(&mut self) -> Option<u32> {
        self.read_pod::<u32>()
    }
}

impl<'data> ReadRaw<'data> for &'data [u8] {
    #[inline]
    fn ensure(&self, len: usize) -> Option<()> {
        if len > self.len() {
            return None
        }
        Some(())
    }

    #[inline]
    fn advance(&mut self, len: usize) -> Option<()> {
        let _slice = self.read_slice(len)?;
        Some(())
    }

    #[inline]
    fn align_relative(&mut self, base: &'data [u8], align_to: usize) -> Option<()> {
        debug_assert!(align_to.is_power_of_two());
        let offset = (self.as_ptr() as usize).checked_sub(base.as_ptr() as usize)?;
        let aligned = offset.checked_add(align_to - 1)? & !(align_to - 1);
        self.advance(aligned - offset)
    }

    #[inline]
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]> {
        self.ensure(len)?;
        let (a, b) = self.split_at(len);
        *self = b;
        Some(a)
    }

    #[inline]
    fn read_cstr(&mut self) -> Option<&'data CStr> {
        let idx = self.iter().position(|byte| *byte == b'\0')?;
        CStr::from_bytes_with_nul(self.read_slice(idx + 1)?).ok()
    }
}


/// Replace characters that would break a line or column oriented
/// report.
pub(crate) fn sanitize_field(field: &str) -> Cow<'_, str> {
    if field.contains(['\t', '\n', '\r']) {
        Cow::Owned(field.replace(['\t', '\n', '\r'], " "))
    } else {
        Cow::Borrowed(field)
    }
}
