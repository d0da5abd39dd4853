//! Header-derived image facts the decoders need.
//!
//! Callers that already parsed their headers fill in [`ImageInfo`] directly.
//! [`ImageInfo::from_headers`] recovers the same fields from the DOS, COFF
//! and optional headers at the start of a mapped image.

use crate::data_dir::{DataDirectories, DataDirectory, DataDirectoryType};
use crate::reader::ImageView;
use crate::{Error, Result};

/// DOS signature "MZ".
pub const DOS_SIGNATURE: u16 = 0x5A4D;

/// PE signature "PE\0\0".
pub const PE_SIGNATURE: u32 = 0x00004550;

/// PE32 optional header magic.
pub const PE32_MAGIC: u16 = 0x10B;

/// PE32+ optional header magic.
pub const PE32PLUS_MAGIC: u16 = 0x20B;

/// Machine types with exception data this crate knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MachineType {
    /// Intel 386 or later.
    I386 = 0x014C,
    /// x64 (AMD64).
    Amd64 = 0x8664,
    /// ARM little endian.
    Arm = 0x01C0,
    /// ARM Thumb-2 little endian.
    ArmNt = 0x01C4,
    /// ARM64 little endian.
    Arm64 = 0xAA64,
}

impl MachineType {
    /// Convert from raw u16 value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x014C => Some(Self::I386),
            0x8664 => Some(Self::Amd64),
            0x01C0 => Some(Self::Arm),
            0x01C4 => Some(Self::ArmNt),
            0xAA64 => Some(Self::Arm64),
            _ => None,
        }
    }

    /// 32-bit ARM, where code addresses carry the Thumb bit.
    pub fn is_arm32(self) -> bool {
        matches!(self, Self::Arm | Self::ArmNt)
    }
}

/// Facts about an image taken from its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Raw COFF machine field.
    pub machine: u16,
    /// 4 for PE32, 8 for PE32+.
    pub pointer_size: u32,
    pub section_alignment: u32,
    /// `ImageBase` from the optional header. VA fields in the image are
    /// relative to this.
    pub preferred_base: u64,
    pub directories: DataDirectories,
}

impl ImageInfo {
    pub fn new(machine: MachineType) -> Self {
        let pointer_size = match machine {
            MachineType::Amd64 | MachineType::Arm64 => 8,
            _ => 4,
        };
        Self {
            machine: machine as u16,
            pointer_size,
            section_alignment: 0x1000,
            preferred_base: if pointer_size == 8 { 0x1_8000_0000 } else { 0x1000_0000 },
            directories: DataDirectories::default(),
        }
    }

    pub fn with_directory(mut self, kind: DataDirectoryType, rva: u32, size: u32) -> Self {
        self.directories.set(kind, DataDirectory::new(rva, size));
        self
    }

    pub fn with_preferred_base(mut self, base: u64) -> Self {
        self.preferred_base = base;
        self
    }

    pub fn with_pointer_size(mut self, pointer_size: u32) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    pub fn machine_type(&self) -> Option<MachineType> {
        MachineType::from_u16(self.machine)
    }

    pub fn is_64bit(&self) -> bool {
        self.pointer_size == 8
    }

    pub fn directory(&self, kind: DataDirectoryType) -> DataDirectory {
        self.directories.get(kind)
    }

    /// Parse the headers at the start of a mapped image.
    pub fn from_headers(image: &ImageView<'_>) -> Result<Self> {
        if image.read_u16_at(0)? != DOS_SIGNATURE {
            return Err(Error::InvalidDosSignature);
        }

        let e_lfanew = image.read_u32_at(0x3C)?;
        if image.read_u32_at(e_lfanew)? != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature);
        }

        let coff = e_lfanew.checked_add(4).ok_or(Error::InvalidPeSignature)?;
        let machine = image.read_u16_at(coff)?;
        let size_of_optional_header = image.read_u16_at(coff.saturating_add(16))? as usize;

        let optional = coff.saturating_add(20);
        let optional_bytes = image.bytes_at(optional, size_of_optional_header)?;
        if optional_bytes.len() < 2 {
            return Err(Error::buffer_too_small(2, optional_bytes.len()));
        }
        let magic = u16::from_le_bytes([optional_bytes[0], optional_bytes[1]]);

        let (pointer_size, base_size, count_offset) = match magic {
            PE32_MAGIC => (4, 96, 92),
            PE32PLUS_MAGIC => (8, 112, 108),
            other => return Err(Error::InvalidOptionalHeaderMagic(other)),
        };
        if optional_bytes.len() < base_size {
            return Err(Error::buffer_too_small(base_size, optional_bytes.len()));
        }

        let preferred_base = if pointer_size == 8 {
            image.read_u64_at(optional.saturating_add(24))?
        } else {
            u64::from(image.read_u32_at(optional.saturating_add(28))?)
        };
        let section_alignment = image.read_u32_at(optional.saturating_add(32))?;
        let count = image.read_u32_at(optional.saturating_add(count_offset))? as usize;
        let directories = DataDirectories::parse(&optional_bytes[base_size..], count)?;

        Ok(Self {
            machine,
            pointer_size,
            section_alignment,
            preferred_base,
            directories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(magic: u16, machine: u16) -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        data[0..2].copy_from_slice(&DOS_SIGNATURE.to_le_bytes());
        data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        data[0x80..0x84].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        data[0x84..0x86].copy_from_slice(&machine.to_le_bytes());
        let (opt_size, count_offset, dirs) = if magic == PE32PLUS_MAGIC {
            (240u16, 108, 112)
        } else {
            (224u16, 92, 96)
        };
        data[0x94..0x96].copy_from_slice(&opt_size.to_le_bytes());
        let opt = 0x98;
        data[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        if magic == PE32PLUS_MAGIC {
            data[opt + 24..opt + 32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
        } else {
            data[opt + 28..opt + 32].copy_from_slice(&0x40_0000u32.to_le_bytes());
        }
        data[opt + 32..opt + 36].copy_from_slice(&0x1000u32.to_le_bytes());
        data[opt + count_offset..opt + count_offset + 4].copy_from_slice(&16u32.to_le_bytes());
        // Exception directory
        let exc = opt + dirs + 3 * 8;
        data[exc..exc + 4].copy_from_slice(&0x3000u32.to_le_bytes());
        data[exc + 4..exc + 8].copy_from_slice(&0x24u32.to_le_bytes());
        data
    }

    #[test]
    fn parses_pe32plus_headers() {
        let data = headers(PE32PLUS_MAGIC, MachineType::Amd64 as u16);
        let info = ImageInfo::from_headers(&ImageView::new(&data)).unwrap();
        assert_eq!(info.machine_type(), Some(MachineType::Amd64));
        assert!(info.is_64bit());
        assert_eq!(info.preferred_base, 0x1_4000_0000);
        assert_eq!(info.section_alignment, 0x1000);
        assert_eq!(
            info.directory(DataDirectoryType::Exception),
            DataDirectory::new(0x3000, 0x24)
        );
    }

    #[test]
    fn parses_pe32_headers() {
        let data = headers(PE32_MAGIC, MachineType::I386 as u16);
        let info = ImageInfo::from_headers(&ImageView::new(&data)).unwrap();
        assert_eq!(info.pointer_size, 4);
        assert_eq!(info.preferred_base, 0x40_0000);
    }

    #[test]
    fn rejects_bad_signatures() {
        let mut data = headers(PE32PLUS_MAGIC, MachineType::Amd64 as u16);
        data[0x80] = 0;
        assert!(matches!(
            ImageInfo::from_headers(&ImageView::new(&data)),
            Err(Error::InvalidPeSignature)
        ));
        data[0] = 0;
        assert!(matches!(
            ImageInfo::from_headers(&ImageView::new(&data)),
            Err(Error::InvalidDosSignature)
        ));
    }

    #[test]
    fn truncated_headers_fail() {
        let data = headers(PE32PLUS_MAGIC, MachineType::Amd64 as u16);
        assert!(ImageInfo::from_headers(&ImageView::new(&data[..0x100])).is_err());
    }
}
