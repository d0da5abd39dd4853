//! Delay-load import directory walking.
//!
//! Delay-load imports are loaded on first use rather than at program startup.
//! Besides the per-descriptor symbols, the walk records where the linker put
//! the delay-load thunks, name strings and module handle slots, so callers
//! can tell those regions apart from ordinary data.

use tracing::trace;

use crate::directory::DirectorySymbols;
use crate::import::{read_dll_name, HintName, ThunkValue};
use crate::range::{RvaRange, RvaRangeSet};
use crate::reader::ImageView;
use crate::symbol::{PeSymbol, ThunkTable, ThunkTarget};
use crate::Result;

/// IMAGE_DELAYLOAD_DESCRIPTOR structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayLoadDescriptor {
    /// Attributes (must be 0 for current version).
    pub attributes: u32,
    /// RVA of the DLL name.
    pub dll_name_rva: u32,
    /// RVA of the module handle.
    pub module_handle_rva: u32,
    /// RVA of the delay-load import address table.
    pub import_address_table_rva: u32,
    /// RVA of the delay-load import name table.
    pub import_name_table_rva: u32,
}

impl DelayLoadDescriptor {
    /// Size of the structure in bytes.
    pub const SIZE: u32 = 32;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            attributes: image.read_u32_at(rva)?,
            dll_name_rva: image.read_u32_at(rva.saturating_add(4))?,
            module_handle_rva: image.read_u32_at(rva.saturating_add(8))?,
            import_address_table_rva: image.read_u32_at(rva.saturating_add(12))?,
            import_name_table_rva: image.read_u32_at(rva.saturating_add(16))?,
        })
    }

    pub fn is_terminator(&self) -> bool {
        self.dll_name_rva == 0 || self.import_address_table_rva == 0 || self.import_name_table_rva == 0
    }
}

/// Regions occupied by delay-load bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayLoadRanges {
    /// INT and IAT slots, terminators included.
    pub thunks: RvaRangeSet,
    /// DLL names and IMAGE_IMPORT_BY_NAME records.
    pub strings: RvaRangeSet,
    /// Module handle slots.
    pub module_handles: RvaRangeSet,
}

#[derive(Default)]
struct RangeCollector {
    thunks: Vec<RvaRange>,
    strings: Vec<RvaRange>,
    module_handles: Vec<RvaRange>,
}

impl RangeCollector {
    fn finish(self, padding: u32) -> DelayLoadRanges {
        DelayLoadRanges {
            thunks: RvaRangeSet::from_ranges(self.thunks, padding),
            strings: RvaRangeSet::from_ranges(self.strings, padding),
            module_handles: RvaRangeSet::from_ranges(self.module_handles, padding),
        }
    }
}

pub(crate) fn read_delay_imports(
    image: &ImageView<'_>,
    rva: u32,
    size: u32,
    pointer_size: u32,
    merge_padding: u32,
    out: &mut DirectorySymbols,
) -> Result<()> {
    out.add_directory_only(PeSymbol::Directory {
        rva,
        size,
        name: "Delay Load Imports".to_string(),
    });

    let mut ranges = RangeCollector::default();
    let end = rva.saturating_add(size);
    let mut descriptor_rva = rva;

    while descriptor_rva < end {
        let descriptor = DelayLoadDescriptor::read(image, descriptor_rva)?;
        if descriptor.is_terminator() {
            out.add(PeSymbol::ImportDescriptor {
                rva: descriptor_rva,
                size: DelayLoadDescriptor::SIZE,
                module: "null terminator".to_string(),
                delay_load: true,
            });
            break;
        }

        let (dll, name) = read_dll_name(image, descriptor.dll_name_rva)?;
        trace!(%dll, rva = descriptor_rva, "delay-load descriptor");
        out.add(PeSymbol::ImportDescriptor {
            rva: descriptor_rva,
            size: DelayLoadDescriptor::SIZE,
            module: dll.clone(),
            delay_load: true,
        });
        ranges.strings.push(name.range());
        out.add(name);

        if descriptor.module_handle_rva != 0 {
            ranges
                .module_handles
                .push(RvaRange::from_rva_and_size(descriptor.module_handle_rva, pointer_size));
        }

        read_thunk_tables(image, &descriptor, pointer_size, &dll, &mut ranges, out)?;

        descriptor_rva = descriptor_rva.saturating_add(DelayLoadDescriptor::SIZE);
    }

    out.delay_load = ranges.finish(merge_padding);
    Ok(())
}

/// Walk the name table and the address table side by side.
fn read_thunk_tables(
    image: &ImageView<'_>,
    descriptor: &DelayLoadDescriptor,
    pointer_size: u32,
    dll: &str,
    ranges: &mut RangeCollector,
    out: &mut DirectorySymbols,
) -> Result<()> {
    let mut int_slot = descriptor.import_name_table_rva;
    let mut iat_slot = descriptor.import_address_table_rva;

    loop {
        let value = image.read_pointer_at(int_slot, pointer_size)?;
        let target = match ThunkValue::decode(value, pointer_size) {
            ThunkValue::Terminator => ThunkTarget::NullTerminator,
            ThunkValue::Ordinal(ordinal) => ThunkTarget::ByOrdinal(ordinal),
            ThunkValue::HintName(hint_name_rva) => {
                let hint_name = HintName::read(image, hint_name_rva)?;
                let symbol = PeSymbol::ImportByName {
                    rva: hint_name_rva,
                    size: hint_name.size(),
                    hint: hint_name.hint,
                    module: dll.to_string(),
                    name: hint_name.name.clone(),
                };
                ranges.strings.push(symbol.range());
                out.add(symbol);
                ThunkTarget::ByName {
                    hint: hint_name.hint,
                    name: hint_name.name,
                }
            }
        };

        let done = target == ThunkTarget::NullTerminator;
        for (slot, table) in [(int_slot, ThunkTable::DelayName), (iat_slot, ThunkTable::DelayAddress)] {
            let symbol = PeSymbol::ImportThunk {
                rva: slot,
                size: pointer_size,
                module: dll.to_string(),
                table,
                target: target.clone(),
            };
            ranges.thunks.push(symbol.range());
            out.add(symbol);
        }
        if done {
            return Ok(());
        }

        int_slot = int_slot.saturating_add(pointer_size);
        iat_slot = iat_slot.saturating_add(pointer_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_load_descriptor_size() {
        assert_eq!(DelayLoadDescriptor::SIZE, 32);
    }

    #[test]
    fn test_null_terminator() {
        let data = [0u8; 32];
        let descriptor = DelayLoadDescriptor::read(&ImageView::new(&data), 0).unwrap();
        assert!(descriptor.is_terminator());
    }

    #[test]
    fn test_missing_name_table_terminates() {
        let mut data = [0u8; 32];
        data[4..8].copy_from_slice(&0x100u32.to_le_bytes());
        data[12..16].copy_from_slice(&0x200u32.to_le_bytes());
        let descriptor = DelayLoadDescriptor::read(&ImageView::new(&data), 0).unwrap();
        assert!(descriptor.is_terminator());
    }

    #[test]
    fn test_buffer_too_small() {
        let data = [0u8; 16];
        assert!(DelayLoadDescriptor::read(&ImageView::new(&data), 0).is_err());
    }
}
