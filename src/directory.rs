//! Symbols for the fixed PE data directories.

use std::collections::btree_map::{self, BTreeMap};

use tracing::{debug, debug_span};

use crate::config::DecoderConfig;
use crate::data_dir::DataDirectoryType;
use crate::debug::{read_debug_directory, DebugSignature};
use crate::delay_import::{read_delay_imports, DelayLoadRanges};
use crate::headers::ImageInfo;
use crate::import::read_imports;
use crate::loadconfig::read_load_config;
use crate::range::RvaRangeSet;
use crate::reader::ImageView;
use crate::symbol::PeSymbol;
use crate::Result;

/// Everything recovered from the data directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySymbols {
    /// Symbols keyed by RVA. The first symbol recorded at an RVA is kept.
    pub symbols: BTreeMap<u32, PeSymbol>,
    /// One symbol per directory that was present.
    pub directories: Vec<PeSymbol>,
    /// PDB identity from the first CodeView entry, when it is RSDS.
    pub debug_signature: Option<DebugSignature>,
    pub delay_load: DelayLoadRanges,
    /// Coalesced ranges of every entry in `symbols`.
    pub ranges: RvaRangeSet,
}

impl DirectorySymbols {
    pub(crate) fn add(&mut self, symbol: PeSymbol) {
        if let btree_map::Entry::Vacant(slot) = self.symbols.entry(symbol.rva()) {
            slot.insert(symbol);
        }
    }

    pub(crate) fn add_directory(&mut self, symbol: PeSymbol) {
        self.directories.push(symbol.clone());
        self.add(symbol);
    }

    /// Record a directory without claiming its RVA in the symbol map.
    pub(crate) fn add_directory_only(&mut self, symbol: PeSymbol) {
        self.directories.push(symbol);
    }

    /// The symbol starting at `rva`.
    pub fn get(&self, rva: u32) -> Option<&PeSymbol> {
        self.symbols.get(&rva)
    }

    /// The directory-level symbol with the given name.
    pub fn directory(&self, name: &str) -> Option<&PeSymbol> {
        self.directories.iter().find(|d| matches!(d, PeSymbol::Directory { name: n, .. } if n == name))
    }
}

/// Walk every supported data directory of the image.
pub fn read_directories(image: &ImageView<'_>, info: &ImageInfo, config: &DecoderConfig) -> Result<DirectorySymbols> {
    let _span = debug_span!("Parsing PE directories").entered();
    let mut out = DirectorySymbols::default();
    let pointer_size = info.pointer_size;

    let export = info.directory(DataDirectoryType::Export);
    if export.is_present() {
        out.add_directory(PeSymbol::Directory {
            rva: export.virtual_address,
            size: export.size,
            name: "Exports".to_string(),
        });
    }

    let import = info.directory(DataDirectoryType::Import);
    if import.is_present() {
        read_imports(image, import.virtual_address, import.size, pointer_size, &mut out)?;
    }

    let delay = info.directory(DataDirectoryType::DelayImport);
    if delay.is_present() {
        read_delay_imports(
            image,
            delay.virtual_address,
            delay.size,
            pointer_size,
            config.delay_load_merge_padding,
            &mut out,
        )?;
    }

    let reloc = info.directory(DataDirectoryType::BaseReloc);
    if reloc.is_present() {
        out.add_directory(PeSymbol::Directory {
            rva: reloc.virtual_address,
            size: reloc.size,
            name: "Base Relocation Table".to_string(),
        });
    }

    let debug_dir = info.directory(DataDirectoryType::Debug);
    if debug_dir.is_present() {
        read_debug_directory(image, debug_dir.virtual_address, debug_dir.size, &mut out)?;
    }

    let load_config = info.directory(DataDirectoryType::LoadConfig);
    if load_config.is_present() {
        read_load_config(
            image,
            load_config.virtual_address,
            load_config.size,
            pointer_size,
            info.preferred_base,
            &mut out,
        )?;
    }

    out.ranges = RvaRangeSet::from_ranges(
        out.symbols.values().map(PeSymbol::range),
        config.pe_symbol_merge_padding,
    );
    debug!(
        symbols = out.symbols.len(),
        directories = out.directories.len(),
        ranges = out.ranges.len(),
        "PE directories parsed"
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::MachineType;

    #[test]
    fn absent_directories_are_a_no_op() {
        let data = vec![0u8; 0x100];
        let info = ImageInfo::new(MachineType::Amd64).with_directory(DataDirectoryType::Import, 0x40, 0);
        let out = read_directories(&ImageView::new(&data), &info, &DecoderConfig::default()).unwrap();
        assert!(out.symbols.is_empty());
        assert!(out.directories.is_empty());
        assert!(out.ranges.is_empty());
    }

    #[test]
    fn first_symbol_at_an_rva_wins() {
        let mut out = DirectorySymbols::default();
        out.add(PeSymbol::Directory {
            rva: 0x10,
            size: 4,
            name: "first".into(),
        });
        out.add(PeSymbol::Directory {
            rva: 0x10,
            size: 8,
            name: "second".into(),
        });
        assert_eq!(out.get(0x10).map(PeSymbol::size), Some(4));
    }

    #[test]
    fn export_and_reloc_directories() {
        let data = vec![0u8; 0x100];
        let info = ImageInfo::new(MachineType::Amd64)
            .with_directory(DataDirectoryType::Export, 0x20, 0x28)
            .with_directory(DataDirectoryType::BaseReloc, 0x50, 0x0C);
        let out = read_directories(&ImageView::new(&data), &info, &DecoderConfig::default()).unwrap();
        assert_eq!(out.directories.len(), 2);
        assert!(out.directory("Exports").is_some());
        assert_eq!(out.directory("Base Relocation Table").map(PeSymbol::rva), Some(0x50));
        // 0x48..0x50 is within the padding of 16.
        assert_eq!(out.ranges.len(), 1);
    }
}
