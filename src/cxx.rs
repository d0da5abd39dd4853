//! Fixed-layout C++ EH metadata (FUNCINFO, `__CxxFrameHandler3` and older).

use tracing::trace;

use crate::handler::XdataParser;
use crate::provider::SymbolProvider;
use crate::reader::ImageView;
use crate::symbol::XdataKind;
use crate::Result;

/// Magic of the only FUNCINFO revision still produced by the compiler.
pub const EH_MAGIC_NUMBER3: u32 = 0x1993_0522;

/// FUNCINFO structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuncInfo {
    pub magic: u32,
    pub max_state: u32,
    pub unwind_map_rva: u32,
    pub try_blocks: u32,
    pub try_block_map_rva: u32,
    pub ip_to_state_entries: u32,
    pub ip_to_state_map_rva: u32,
}

impl FuncInfo {
    pub const SIZE: u32 = 40;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        let mut cursor = image.cursor(rva);
        Ok(Self {
            magic: cursor.read_u32()?,
            max_state: cursor.read_u32()?,
            unwind_map_rva: cursor.read_u32()?,
            try_blocks: cursor.read_u32()?,
            try_block_map_rva: cursor.read_u32()?,
            ip_to_state_entries: cursor.read_u32()?,
            ip_to_state_map_rva: cursor.read_u32()?,
        })
    }
}

/// UnwindMapEntry size.
pub const UNWIND_MAP_ENTRY_SIZE: u32 = 8;
/// TryBlockMapEntry size.
pub const TRY_BLOCK_MAP_ENTRY_SIZE: u32 = 20;
/// HandlerType size.
pub const HANDLER_TYPE_SIZE: u32 = 20;
/// IpToStateMapEntry size.
pub const IP_TO_STATE_ENTRY_SIZE: u32 = 8;

/// TryBlockMapEntry fields that locate the catch handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TryBlockMapEntry {
    catches: u32,
    handler_array_rva: u32,
}

impl TryBlockMapEntry {
    fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            catches: image.read_u32_at(rva.saturating_add(12))?,
            handler_array_rva: image.read_u32_at(rva.saturating_add(16))?,
        })
    }
}

fn table_size(count: u32, entry_size: u32) -> u32 {
    count.saturating_mul(entry_size)
}

/// Record a FUNCINFO and every table it points at.
pub(crate) fn parse_func_info<P: SymbolProvider + ?Sized>(
    parser: &mut XdataParser<'_, P>,
    function_start: u32,
    rva: u32,
) -> Result<()> {
    let info = FuncInfo::read(&parser.image, rva)?;
    trace!(rva, ?info, "FUNCINFO");
    parser.add(XdataKind::CppXdata, function_start, rva, FuncInfo::SIZE);

    if info.max_state > 0 && info.unwind_map_rva > 0 {
        parser.add(
            XdataKind::StateUnwindMap,
            function_start,
            info.unwind_map_rva,
            table_size(info.max_state, UNWIND_MAP_ENTRY_SIZE),
        );
    }

    if info.try_blocks > 0 && info.try_block_map_rva > 0 {
        parser.add(
            XdataKind::TryMap,
            function_start,
            info.try_block_map_rva,
            table_size(info.try_blocks, TRY_BLOCK_MAP_ENTRY_SIZE),
        );

        for index in 0..info.try_blocks {
            let entry_rva = info
                .try_block_map_rva
                .saturating_add(index.saturating_mul(TRY_BLOCK_MAP_ENTRY_SIZE));
            let entry = TryBlockMapEntry::read(&parser.image, entry_rva)?;
            if entry.catches > 0 && entry.handler_array_rva > 0 {
                parser.add(
                    XdataKind::HandlerMap,
                    function_start,
                    entry.handler_array_rva,
                    table_size(entry.catches, HANDLER_TYPE_SIZE),
                );
            }
        }
    }

    if info.ip_to_state_entries > 0 && info.ip_to_state_map_rva > 0 {
        parser.add(
            XdataKind::IpToStateMap,
            function_start,
            info.ip_to_state_map_rva,
            table_size(info.ip_to_state_entries, IP_TO_STATE_ENTRY_SIZE),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::UnwindArch;
    use crate::provider::{CodeSymbol, SourceLanguage};

    struct NoSymbols;

    impl SymbolProvider for NoSymbols {
        fn resolve_code_symbol_at(&self, _rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
            None
        }

        fn language_of(&self, _rva: u32) -> SourceLanguage {
            SourceLanguage::Cpp
        }

        fn resolve_runtime_routine_rva(&self, _name: &str) -> Option<u32> {
            None
        }

        fn resolve_public_thunk_target(&self, _rva: u32) -> Option<u32> {
            None
        }
    }

    fn put(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn records_every_table() {
        let mut data = vec![0u8; 0x400];
        // FUNCINFO at 0x100.
        put(&mut data, 0x100, EH_MAGIC_NUMBER3);
        put(&mut data, 0x104, 3);
        put(&mut data, 0x108, 0x200);
        put(&mut data, 0x10C, 2);
        put(&mut data, 0x110, 0x240);
        put(&mut data, 0x114, 5);
        put(&mut data, 0x118, 0x300);
        // Two try blocks, each with its own handler array.
        put(&mut data, 0x240 + 12, 1);
        put(&mut data, 0x240 + 16, 0x280);
        put(&mut data, 0x254 + 12, 2);
        put(&mut data, 0x254 + 16, 0x2A0);

        let provider = NoSymbols;
        let mut parser = XdataParser::new(ImageView::new(&data), &provider, UnwindArch::X64);
        parse_func_info(&mut parser, 0x1000, 0x100).unwrap();

        let sizes: Vec<_> = parser.xdata.values().map(|s| (s.rva, s.kind, s.size)).collect();
        assert_eq!(
            sizes,
            vec![
                (0x100, XdataKind::CppXdata, 40),
                (0x200, XdataKind::StateUnwindMap, 24),
                (0x240, XdataKind::TryMap, 40),
                (0x280, XdataKind::HandlerMap, 20),
                (0x2A0, XdataKind::HandlerMap, 40),
                (0x300, XdataKind::IpToStateMap, 40),
            ]
        );
        assert!(parser.xdata.values().all(|s| s.target_start_rva == 0x1000));
    }

    #[test]
    fn zero_counts_emit_only_the_header() {
        let mut data = vec![0u8; 0x100];
        put(&mut data, 0, EH_MAGIC_NUMBER3);
        put(&mut data, 8, 0x80);
        let provider = NoSymbols;
        let mut parser = XdataParser::new(ImageView::new(&data), &provider, UnwindArch::X64);
        parse_func_info(&mut parser, 0x1000, 0).unwrap();
        assert_eq!(parser.xdata.len(), 1);
    }
}
