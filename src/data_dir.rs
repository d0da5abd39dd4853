//! Data Directory structures and parsing.

use crate::{Error, Result};

/// Data directory type - type-safe enum for data directory indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DataDirectoryType {
    /// Export table (.edata)
    Export = 0,
    /// Import table (.idata)
    Import = 1,
    /// Resource table (.rsrc)
    Resource = 2,
    /// Exception table (.pdata)
    Exception = 3,
    /// Certificate/Security table
    Security = 4,
    /// Base relocation table (.reloc)
    BaseReloc = 5,
    /// Debug directory
    Debug = 6,
    /// Architecture-specific data
    Architecture = 7,
    /// Global pointer register value
    GlobalPtr = 8,
    /// Thread local storage (.tls)
    Tls = 9,
    /// Load configuration
    LoadConfig = 10,
    /// Bound import table
    BoundImport = 11,
    /// Import address table
    Iat = 12,
    /// Delay import descriptor
    DelayImport = 13,
    /// CLR runtime header
    ClrRuntime = 14,
    /// Reserved
    Reserved = 15,
}

impl DataDirectoryType {
    /// Get the index value.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Try to create from an index.
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Export),
            1 => Some(Self::Import),
            2 => Some(Self::Resource),
            3 => Some(Self::Exception),
            4 => Some(Self::Security),
            5 => Some(Self::BaseReloc),
            6 => Some(Self::Debug),
            7 => Some(Self::Architecture),
            8 => Some(Self::GlobalPtr),
            9 => Some(Self::Tls),
            10 => Some(Self::LoadConfig),
            11 => Some(Self::BoundImport),
            12 => Some(Self::Iat),
            13 => Some(Self::DelayImport),
            14 => Some(Self::ClrRuntime),
            15 => Some(Self::Reserved),
            _ => None,
        }
    }
}

/// Number of data directories in the optional header.
pub const NUMBER_OF_DIRECTORY_ENTRIES: usize = 16;

/// Data Directory entry (IMAGE_DATA_DIRECTORY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory {
    /// RVA (Relative Virtual Address) of the table.
    pub virtual_address: u32,
    /// Size of the table in bytes.
    pub size: u32,
}

impl DataDirectory {
    /// Size of a data directory entry in bytes.
    pub const SIZE: usize = 8;

    pub const fn new(virtual_address: u32, size: u32) -> Self {
        Self {
            virtual_address,
            size,
        }
    }

    /// Parse a data directory from a byte slice.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::buffer_too_small(Self::SIZE, data.len()));
        }

        Ok(Self {
            virtual_address: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            size: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    /// A directory only describes anything when both fields are non-zero.
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }

    /// One past the last byte of the directory.
    pub fn end(&self) -> u32 {
        self.virtual_address.saturating_add(self.size)
    }
}

/// The sixteen directory slots of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectories([DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES]);

impl DataDirectories {
    pub fn get(&self, kind: DataDirectoryType) -> DataDirectory {
        self.0[kind.as_index()]
    }

    pub fn set(&mut self, kind: DataDirectoryType, directory: DataDirectory) {
        self.0[kind.as_index()] = directory;
    }

    /// Builder-style variant of [`DataDirectories::set`].
    pub fn with(mut self, kind: DataDirectoryType, directory: DataDirectory) -> Self {
        self.set(kind, directory);
        self
    }

    /// Parse up to sixteen consecutive entries; missing trailing slots stay
    /// zero.
    pub fn parse(data: &[u8], count: usize) -> Result<Self> {
        let mut dirs = Self::default();
        for i in 0..count.min(NUMBER_OF_DIRECTORY_ENTRIES) {
            let offset = i * DataDirectory::SIZE;
            let entry = data
                .get(offset..)
                .ok_or_else(|| Error::buffer_too_small(offset + DataDirectory::SIZE, data.len()))?;
            dirs.0[i] = DataDirectory::parse(entry)?;
        }
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_directory_size() {
        assert_eq!(DataDirectory::SIZE, 8);
    }

    #[test]
    fn test_data_directory_presence() {
        assert!(DataDirectory::new(0x1000, 0x200).is_present());
        assert!(!DataDirectory::new(0x1000, 0).is_present());
        assert!(!DataDirectory::new(0, 0x200).is_present());
        assert!(!DataDirectory::default().is_present());
    }

    #[test]
    fn test_data_directory_type_values() {
        assert_eq!(DataDirectoryType::Export.as_index(), 0);
        assert_eq!(DataDirectoryType::Import.as_index(), 1);
        assert_eq!(DataDirectoryType::Resource.as_index(), 2);
        assert_eq!(DataDirectoryType::Exception.as_index(), 3);
        assert_eq!(DataDirectoryType::BaseReloc.as_index(), 5);
        assert_eq!(DataDirectoryType::LoadConfig.as_index(), 10);
        assert_eq!(DataDirectoryType::DelayImport.as_index(), 13);
        assert_eq!(DataDirectoryType::from_index(16), None);
    }

    #[test]
    fn test_parse_directories() {
        let mut raw = vec![0u8; 24];
        raw[8..12].copy_from_slice(&0x2000u32.to_le_bytes());
        raw[12..16].copy_from_slice(&0x40u32.to_le_bytes());
        let dirs = DataDirectories::parse(&raw, 3).unwrap();
        assert_eq!(dirs.get(DataDirectoryType::Import), DataDirectory::new(0x2000, 0x40));
        assert!(!dirs.get(DataDirectoryType::Export).is_present());
        assert!(DataDirectories::parse(&raw, 4).is_err());
    }
}
