//! Import directory walking.
//!
//! Each IMAGE_IMPORT_DESCRIPTOR contributes a descriptor symbol, the DLL
//! name string and one symbol per import lookup table slot. Named imports
//! also contribute their IMAGE_IMPORT_BY_NAME record.

use tracing::trace;

use crate::directory::DirectorySymbols;
use crate::reader::ImageView;
use crate::symbol::{PeSymbol, ThunkTable, ThunkTarget};
use crate::Result;

/// IMAGE_IMPORT_DESCRIPTOR - 20 bytes
/// Describes one imported DLL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportDescriptor {
    /// RVA to the Import Lookup Table (or INT - Import Name Table).
    pub original_first_thunk: u32,
    /// RVA to the DLL name (null-terminated string).
    pub name_rva: u32,
    /// RVA to the Import Address Table (IAT).
    pub first_thunk: u32,
}

impl ImportDescriptor {
    pub const SIZE: u32 = 20;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            original_first_thunk: image.read_u32_at(rva)?,
            name_rva: image.read_u32_at(rva.saturating_add(12))?,
            first_thunk: image.read_u32_at(rva.saturating_add(16))?,
        })
    }

    /// The walk ends at the first descriptor without a name or lookup table.
    pub fn is_terminator(&self) -> bool {
        self.name_rva == 0 || self.original_first_thunk == 0
    }
}

/// Decoded import lookup table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThunkValue {
    Terminator,
    Ordinal(u16),
    /// RVA of an IMAGE_IMPORT_BY_NAME.
    HintName(u32),
}

impl ThunkValue {
    pub(crate) fn decode(value: u64, pointer_size: u32) -> Self {
        let ordinal_flag = if pointer_size == 8 {
            0x8000_0000_0000_0000
        } else {
            0x8000_0000
        };
        if value == 0 {
            Self::Terminator
        } else if value & ordinal_flag != 0 {
            Self::Ordinal((value & 0xFFFF) as u16)
        } else {
            Self::HintName((value & 0x7FFF_FFFF) as u32)
        }
    }
}

/// IMAGE_IMPORT_BY_NAME: u16 hint followed by a NUL-terminated name.
pub(crate) struct HintName {
    pub hint: u16,
    pub name: String,
    /// Length of the name as stored, which differs from `name.len()` when
    /// the name is not valid UTF-8.
    name_len: u32,
}

impl HintName {
    pub(crate) fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        let raw = image.cstr_bytes_at(rva.saturating_add(2))?;
        Ok(Self {
            hint: image.read_u16_at(rva)?,
            name: String::from_utf8_lossy(raw).into_owned(),
            name_len: raw.len() as u32,
        })
    }

    /// Bytes covered by the record, including the terminator.
    pub(crate) fn size(&self) -> u32 {
        2 + self.name_len + 1
    }
}

/// Read the NUL-terminated DLL name at `rva` together with the symbol for
/// its bytes.
pub(crate) fn read_dll_name(image: &ImageView<'_>, rva: u32) -> Result<(String, PeSymbol)> {
    let raw = image.cstr_bytes_at(rva)?;
    let dll = String::from_utf8_lossy(raw).into_owned();
    let symbol = PeSymbol::ImportString {
        rva,
        size: raw.len() as u32 + 1,
        value: dll.clone(),
    };
    Ok((dll, symbol))
}

pub(crate) fn read_imports(
    image: &ImageView<'_>,
    rva: u32,
    size: u32,
    pointer_size: u32,
    out: &mut DirectorySymbols,
) -> Result<()> {
    let end = rva.saturating_add(size);
    let mut descriptor_rva = rva;

    while descriptor_rva < end {
        let descriptor = ImportDescriptor::read(image, descriptor_rva)?;
        if descriptor.is_terminator() {
            out.add(PeSymbol::ImportDescriptor {
                rva: descriptor_rva,
                size: ImportDescriptor::SIZE,
                module: "null terminator".to_string(),
                delay_load: false,
            });
            break;
        }

        let (dll, name) = read_dll_name(image, descriptor.name_rva)?;
        trace!(%dll, rva = descriptor_rva, "import descriptor");
        out.add(PeSymbol::ImportDescriptor {
            rva: descriptor_rva,
            size: ImportDescriptor::SIZE,
            module: dll.clone(),
            delay_load: false,
        });
        out.add(name);

        read_lookup_table(image, descriptor.original_first_thunk, pointer_size, &dll, out)?;

        descriptor_rva = descriptor_rva.saturating_add(ImportDescriptor::SIZE);
    }

    Ok(())
}

fn read_lookup_table(
    image: &ImageView<'_>,
    table_rva: u32,
    pointer_size: u32,
    dll: &str,
    out: &mut DirectorySymbols,
) -> Result<()> {
    let mut slot = table_rva;
    loop {
        let value = image.read_pointer_at(slot, pointer_size)?;
        let target = match ThunkValue::decode(value, pointer_size) {
            ThunkValue::Terminator => ThunkTarget::NullTerminator,
            ThunkValue::Ordinal(ordinal) => ThunkTarget::ByOrdinal(ordinal),
            ThunkValue::HintName(hint_name_rva) => {
                let hint_name = HintName::read(image, hint_name_rva)?;
                out.add(PeSymbol::ImportByName {
                    rva: hint_name_rva,
                    size: hint_name.size(),
                    hint: hint_name.hint,
                    module: dll.to_string(),
                    name: hint_name.name.clone(),
                });
                ThunkTarget::ByName {
                    hint: hint_name.hint,
                    name: hint_name.name,
                }
            }
        };

        let done = target == ThunkTarget::NullTerminator;
        out.add(PeSymbol::ImportThunk {
            rva: slot,
            size: pointer_size,
            module: dll.to_string(),
            table: ThunkTable::ImportLookup,
            target,
        });
        if done {
            return Ok(());
        }
        slot = slot.saturating_add(pointer_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thunk_value_decoding() {
        assert_eq!(ThunkValue::decode(0, 8), ThunkValue::Terminator);
        assert_eq!(ThunkValue::decode(0x8000_0000_0000_0010, 8), ThunkValue::Ordinal(0x10));
        assert_eq!(ThunkValue::decode(0x8000_0010, 4), ThunkValue::Ordinal(0x10));
        assert_eq!(ThunkValue::decode(0x2000, 4), ThunkValue::HintName(0x2000));
    }

    #[test]
    fn test_import_descriptor_terminator() {
        let data = [0u8; 20];
        let descriptor = ImportDescriptor::read(&ImageView::new(&data), 0).unwrap();
        assert!(descriptor.is_terminator());
    }

    #[test]
    fn test_hint_name_size() {
        let mut data = vec![0x05, 0x00];
        data.extend_from_slice(b"ExitProcess\0");
        let hint_name = HintName::read(&ImageView::new(&data), 0).unwrap();
        assert_eq!(hint_name.hint, 5);
        assert_eq!(hint_name.name, "ExitProcess");
        assert_eq!(hint_name.size(), 14);
    }

    #[test]
    fn test_non_utf8_names_keep_their_stored_size() {
        let data = b"\x05\x00A\xFFB\0";
        let hint_name = HintName::read(&ImageView::new(data), 0).unwrap();
        assert_eq!(hint_name.name, "A\u{FFFD}B");
        assert_eq!(hint_name.size(), 6);

        let (dll, symbol) = read_dll_name(&ImageView::new(b"K\xFF\0"), 0).unwrap();
        assert_eq!(dll, "K\u{FFFD}");
        assert_eq!(symbol.size(), 3);
        assert_eq!(symbol.range(), crate::range::RvaRange::new(0, 3));
    }
}
