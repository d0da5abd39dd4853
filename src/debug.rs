//! Debug directory walking.
//!
//! Every debug entry with a payload becomes a `[Debug Directory] <type>`
//! symbol. The first CodeView entry also yields the PDB signature the image
//! was linked against, when its payload is an RSDS record.

use tracing::{debug, trace};

use crate::directory::DirectorySymbols;
use crate::reader::ImageView;
use crate::symbol::PeSymbol;
use crate::Result;

/// Debug types (IMAGE_DEBUG_TYPE_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DebugType {
    Unknown = 0,
    Coff = 1,
    CodeView = 2,
    Fpo = 3,
    Misc = 4,
    Exception = 5,
    Fixup = 6,
    OmapToSrc = 7,
    OmapFromSrc = 8,
    Borland = 9,
    Reserved10 = 10,
    Clsid = 11,
    VcFeature = 12,
    Pogo = 13,
    Iltcg = 14,
    Mpx = 15,
    Repro = 16,
    ExDllCharacteristics = 20,
}

impl DebugType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Coff,
            2 => Self::CodeView,
            3 => Self::Fpo,
            4 => Self::Misc,
            5 => Self::Exception,
            6 => Self::Fixup,
            7 => Self::OmapToSrc,
            8 => Self::OmapFromSrc,
            9 => Self::Borland,
            10 => Self::Reserved10,
            11 => Self::Clsid,
            12 => Self::VcFeature,
            13 => Self::Pogo,
            14 => Self::Iltcg,
            15 => Self::Mpx,
            16 => Self::Repro,
            20 => Self::ExDllCharacteristics,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Coff => "COFF",
            Self::CodeView => "CodeView",
            Self::Fpo => "FPO",
            Self::Misc => "Misc",
            Self::Exception => "Exception",
            Self::Fixup => "Fixup",
            Self::OmapToSrc => "OmapToSrc",
            Self::OmapFromSrc => "OmapFromSrc",
            Self::Borland => "Borland",
            Self::Reserved10 => "Reserved10",
            Self::Clsid => "CLSID",
            Self::VcFeature => "VC Feature",
            Self::Pogo => "POGO",
            Self::Iltcg => "ILTCG",
            Self::Mpx => "MPX",
            Self::Repro => "Repro",
            Self::ExDllCharacteristics => "ExDllCharacteristics",
        }
    }
}

/// IMAGE_DEBUG_DIRECTORY - 28 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugDirectory {
    /// Debug type.
    pub debug_type: u32,
    /// Size of debug data.
    pub size_of_data: u32,
    /// RVA of debug data (when loaded).
    pub address_of_raw_data: u32,
}

impl DebugDirectory {
    pub const SIZE: u32 = 28;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            debug_type: image.read_u32_at(rva.saturating_add(12))?,
            size_of_data: image.read_u32_at(rva.saturating_add(16))?,
            address_of_raw_data: image.read_u32_at(rva.saturating_add(20))?,
        })
    }

    /// Get the debug type as an enum.
    pub fn get_type(&self) -> DebugType {
        DebugType::from_u32(self.debug_type)
    }
}

/// CodeView PDB 7.0 signature (RSDS).
pub const CV_SIGNATURE_RSDS: u32 = 0x53445352; // "RSDS"

/// PDB identity recorded in a CodeView RSDS entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSignature {
    /// GUID (16 bytes).
    pub guid: [u8; 16],
    /// Age/revision.
    pub age: u32,
    /// Path to PDB file.
    pub pdb_path: String,
}

impl DebugSignature {
    /// Read the RSDS payload at `rva`. Returns `None` for other CodeView
    /// formats.
    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Option<Self>> {
        if image.read_u32_at(rva)? != CV_SIGNATURE_RSDS {
            return Ok(None);
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(image.bytes_at(rva.saturating_add(4), 16)?);
        let age = image.read_u32_at(rva.saturating_add(20))?;
        let pdb_path = image.read_cstr_at(rva.saturating_add(24))?;

        Ok(Some(Self { guid, age, pdb_path }))
    }

    /// Format GUID as a string (Microsoft format).
    pub fn guid_string(&self) -> String {
        format!(
            "{:08X}{:04X}{:04X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            u32::from_le_bytes([self.guid[0], self.guid[1], self.guid[2], self.guid[3]]),
            u16::from_le_bytes([self.guid[4], self.guid[5]]),
            u16::from_le_bytes([self.guid[6], self.guid[7]]),
            self.guid[8], self.guid[9], self.guid[10], self.guid[11],
            self.guid[12], self.guid[13], self.guid[14], self.guid[15]
        )
    }

    /// Key used by symbol servers: GUID followed by the age in hex.
    pub fn symbol_server_key(&self) -> String {
        format!("{}{:X}", self.guid_string(), self.age)
    }
}

pub(crate) fn read_debug_directory(
    image: &ImageView<'_>,
    rva: u32,
    size: u32,
    out: &mut DirectorySymbols,
) -> Result<()> {
    out.add_directory(PeSymbol::Directory {
        rva,
        size,
        name: "Debug".to_string(),
    });

    let count = size / DebugDirectory::SIZE;
    let mut seen_codeview = false;
    for i in 0..count {
        let entry = DebugDirectory::read(image, rva.saturating_add(i * DebugDirectory::SIZE))?;
        if entry.size_of_data == 0 {
            continue;
        }

        let debug_type = entry.get_type();
        trace!(
            kind = debug_type.name(),
            rva = entry.address_of_raw_data,
            size = entry.size_of_data,
            "debug entry"
        );
        out.add(PeSymbol::DebugData {
            rva: entry.address_of_raw_data,
            size: entry.size_of_data,
            debug_type,
        });

        // Only the first CodeView entry names the PDB, RSDS or not.
        if debug_type == DebugType::CodeView && !seen_codeview {
            seen_codeview = true;
            out.debug_signature = DebugSignature::read(image, entry.address_of_raw_data)?;
            if let Some(signature) = &out.debug_signature {
                debug!(pdb = %signature.pdb_path, age = signature.age, "CodeView RSDS");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_type_names() {
        assert_eq!(DebugType::from_u32(2), DebugType::CodeView);
        assert_eq!(DebugType::from_u32(13).name(), "POGO");
        assert_eq!(DebugType::from_u32(99), DebugType::Unknown);
    }

    #[test]
    fn test_rsds_signature() {
        let mut data = vec![0u8; 64];
        data[0..4].copy_from_slice(&CV_SIGNATURE_RSDS.to_le_bytes());
        data[4..8].copy_from_slice(&0x12345678u32.to_le_bytes());
        data[8..10].copy_from_slice(&0xABCDu16.to_le_bytes());
        data[10..12].copy_from_slice(&0xEF01u16.to_le_bytes());
        data[12..20].copy_from_slice(&[0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0x01]);
        data[20..24].copy_from_slice(&3u32.to_le_bytes());
        data[24..31].copy_from_slice(b"app.pdb");

        let sig = DebugSignature::read(&ImageView::new(&data), 0).unwrap().unwrap();
        assert_eq!(sig.age, 3);
        assert_eq!(sig.pdb_path, "app.pdb");
        assert_eq!(sig.guid_string(), "12345678ABCDEF0123456789ABCDEF01");
        assert_eq!(sig.symbol_server_key(), "12345678ABCDEF0123456789ABCDEF013");
    }

    #[test]
    fn test_only_the_first_codeview_entry_is_read() {
        let mut data = vec![0u8; 0x100];
        for (i, payload) in [0x80u32, 0xC0].into_iter().enumerate() {
            let entry = i * DebugDirectory::SIZE as usize;
            data[entry + 12..entry + 16].copy_from_slice(&2u32.to_le_bytes());
            data[entry + 16..entry + 20].copy_from_slice(&32u32.to_le_bytes());
            data[entry + 20..entry + 24].copy_from_slice(&payload.to_le_bytes());
        }
        data[0x80..0x84].copy_from_slice(b"NB10");
        data[0xC0..0xC4].copy_from_slice(&CV_SIGNATURE_RSDS.to_le_bytes());
        data[0xD8..0xDF].copy_from_slice(b"app.pdb");

        let mut out = DirectorySymbols::default();
        read_debug_directory(&ImageView::new(&data), 0, 2 * DebugDirectory::SIZE, &mut out).unwrap();
        assert!(out.debug_signature.is_none());
        assert_eq!(out.get(0xC0).map(|s| s.name()).as_deref(), Some("[Debug Directory] CodeView"));
    }

    #[test]
    fn test_non_rsds_codeview_is_ignored() {
        let data = b"NB10\0\0\0\0\0\0\0\0";
        assert!(DebugSignature::read(&ImageView::new(data), 0).unwrap().is_none());
    }
}
