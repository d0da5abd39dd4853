#![no_main]

use libfuzzer_sys::fuzz_target;
use pe_unwind::{
    parse_exception_tables, read_directories, walk_resources, CodeSymbol, DecoderConfig, ImageInfo,
    ImageView, SourceLanguage, SymbolProvider,
};

/// Pretends every runtime routine lives at a fixed RVA so handler data
/// gets decoded too.
struct FixedRoutines;

impl SymbolProvider for FixedRoutines {
    fn resolve_code_symbol_at(&self, rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
        Some(CodeSymbol::new(rva, 0x10, "fuzzed"))
    }

    fn language_of(&self, _rva: u32) -> SourceLanguage {
        SourceLanguage::Cpp
    }

    fn resolve_runtime_routine_rva(&self, name: &str) -> Option<u32> {
        match name {
            "__C_specific_handler" => Some(0x1000),
            "__GSHandlerCheck" => Some(0x1010),
            "__GSHandlerCheck_EH4" => Some(0x1020),
            "__CxxFrameHandler3" => Some(0x1030),
            "__CxxFrameHandler4" => Some(0x1040),
            _ => None,
        }
    }

    fn resolve_public_thunk_target(&self, _rva: u32) -> Option<u32> {
        None
    }
}

fuzz_target!(|data: &[u8]| {
    let image = ImageView::new(data);
    let Ok(info) = ImageInfo::from_headers(&image) else {
        return;
    };
    let config = DecoderConfig::default();
    let _ = read_directories(&image, &info, &config);
    let _ = walk_resources(&image, &info);
    let _ = parse_exception_tables(&image, &info, &FixedRoutines, &config);
});
