//! Bounds-checked access to a mapped image.
//!
//! All addresses are RVAs into a buffer laid out the way the loader maps the
//! image. Reads never go past the end of the buffer: they fail with
//! [`Error::OffsetOutOfBounds`] instead.

use crate::{Error, Result};

/// Read-only view over the bytes of a mapped image.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Total number of mapped bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check whether `len` bytes starting at `rva` lie inside the image.
    pub fn contains(&self, rva: u32, len: usize) -> bool {
        (rva as u64) + (len as u64) <= self.data.len() as u64
    }

    /// Borrow `len` bytes at `rva`.
    pub fn bytes_at(&self, rva: u32, len: usize) -> Result<&'a [u8]> {
        let start = rva as usize;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or_else(|| Error::out_of_bounds(rva as u64, len, self.data.len()))
    }

    fn array_at<const N: usize>(&self, rva: u32) -> Result<[u8; N]> {
        let bytes = self.bytes_at(rva, N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    pub fn read_u8_at(&self, rva: u32) -> Result<u8> {
        Ok(self.array_at::<1>(rva)?[0])
    }

    /// Read a u16 at the given RVA (little-endian).
    pub fn read_u16_at(&self, rva: u32) -> Result<u16> {
        self.array_at(rva).map(u16::from_le_bytes)
    }

    /// Read a u32 at the given RVA (little-endian).
    pub fn read_u32_at(&self, rva: u32) -> Result<u32> {
        self.array_at(rva).map(u32::from_le_bytes)
    }

    /// Read a u64 at the given RVA (little-endian).
    pub fn read_u64_at(&self, rva: u32) -> Result<u64> {
        self.array_at(rva).map(u64::from_le_bytes)
    }

    /// Read an i32 at the given RVA (little-endian).
    pub fn read_i32_at(&self, rva: u32) -> Result<i32> {
        self.array_at(rva).map(i32::from_le_bytes)
    }

    /// Read a pointer-sized value (4 or 8 bytes).
    pub fn read_pointer_at(&self, rva: u32, pointer_size: u32) -> Result<u64> {
        if pointer_size == 8 {
            self.read_u64_at(rva)
        } else {
            self.read_u32_at(rva).map(u64::from)
        }
    }

    /// Bytes of the NUL-terminated narrow string at `rva`, without the
    /// terminator. The terminator must be inside the image.
    pub fn cstr_bytes_at(&self, rva: u32) -> Result<&'a [u8]> {
        let tail = self
            .data
            .get(rva as usize..)
            .ok_or_else(|| Error::out_of_bounds(rva as u64, 1, self.data.len()))?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::out_of_bounds(rva as u64, tail.len() + 1, self.data.len()))?;
        Ok(&tail[..end])
    }

    /// Read a NUL-terminated narrow string, replacing invalid UTF-8.
    pub fn read_cstr_at(&self, rva: u32) -> Result<String> {
        self.cstr_bytes_at(rva)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read `chars` UTF-16LE code units at `rva`.
    pub fn read_utf16_at(&self, rva: u32, chars: usize) -> Result<String> {
        let len = chars
            .checked_mul(2)
            .ok_or_else(|| Error::out_of_bounds(rva as u64, usize::MAX, self.data.len()))?;
        let bytes = self.bytes_at(rva, len)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    /// Start a sequential cursor at `rva`.
    pub fn cursor(&self, rva: u32) -> ImageCursor<'a> {
        ImageCursor {
            image: *self,
            position: rva,
        }
    }
}

/// Sequential reader that advances through the image.
#[derive(Debug, Clone)]
pub struct ImageCursor<'a> {
    image: ImageView<'a>,
    position: u32,
}

impl<'a> ImageCursor<'a> {
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn image(&self) -> &ImageView<'a> {
        &self.image
    }

    /// Move forward by `count` bytes without reading them.
    pub fn skip(&mut self, count: u32) -> Result<()> {
        self.position = self
            .position
            .checked_add(count)
            .ok_or_else(|| Error::out_of_bounds(self.position as u64, count as usize, self.image.size()))?;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.image.read_u8_at(self.position)?;
        self.skip(1)?;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let value = self.image.read_u16_at(self.position)?;
        self.skip(2)?;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.image.read_u32_at(self.position)?;
        self.skip(4)?;
        Ok(value)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let value = self.image.read_i32_at(self.position)?;
        self.skip(4)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_view() {
        let data = [0x4D, 0x5A, 0x90, 0x00];
        let image = ImageView::new(&data);
        assert_eq!(image.size(), 4);
        assert_eq!(image.read_u16_at(0).unwrap(), 0x5A4D);
        assert_eq!(image.read_u32_at(0).unwrap(), 0x0090_5A4D);
    }

    #[test]
    fn test_read_past_end() {
        let data = [0x4D, 0x5A];
        let image = ImageView::new(&data);
        assert!(matches!(
            image.read_u32_at(0),
            Err(Error::OffsetOutOfBounds { offset: 0, len: 4, size: 2 })
        ));
        assert!(image.read_u8_at(u32::MAX).is_err());
    }

    #[test]
    fn test_cstr_requires_terminator() {
        let image = ImageView::new(b"abc\0def");
        assert_eq!(image.read_cstr_at(0).unwrap(), "abc");
        assert!(image.read_cstr_at(4).is_err());
    }

    #[test]
    fn test_utf16() {
        let data = [b'H', 0, b'i', 0];
        let image = ImageView::new(&data);
        assert_eq!(image.read_utf16_at(0, 2).unwrap(), "Hi");
        assert!(image.read_utf16_at(0, 3).is_err());
    }

    #[test]
    fn test_cursor_advances() {
        let data = [1, 2, 0, 3, 0, 0, 0];
        let mut cursor = ImageView::new(&data).cursor(0);
        assert_eq!(cursor.read_u8().unwrap(), 1);
        assert_eq!(cursor.read_u16().unwrap(), 2);
        assert_eq!(cursor.read_u32().unwrap(), 3);
        assert_eq!(cursor.position(), 7);
        assert!(cursor.read_u8().is_err());
    }
}
