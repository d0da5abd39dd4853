//! Symbol records produced by the decoders.
//!
//! Every record carries the RVA and size of the bytes it accounts for and
//! can render a human readable name. Exception-handling records only store
//! the RVA of the code they describe; the owning code symbol is looked up
//! through a [`SymbolProvider`] whenever a name is needed.

use std::collections::btree_map::{self, BTreeMap};

use crate::debug::DebugType;
use crate::provider::{target_symbol, CodeSymbol, SymbolProvider};
use crate::range::RvaRange;

/// Which Control Flow Guard table a load-config symbol describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadConfigTableKind {
    /// Guard CF function table (GFIDS).
    Gfids,
    /// Address-taken IAT entry table (GIATS).
    Giats,
}

impl LoadConfigTableKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gfids => "FID Table",
            Self::Giats => "IAT Address-Taken Table",
        }
    }
}

/// Which thunk array an import thunk lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkTable {
    /// Import lookup table of a regular import descriptor.
    ImportLookup,
    /// Delay-load import name table.
    DelayName,
    /// Delay-load import address table.
    DelayAddress,
}

impl ThunkTable {
    fn prefix(self) -> &'static str {
        match self {
            Self::ImportLookup => "[import thunk]",
            Self::DelayName => "[delay INT]",
            Self::DelayAddress => "[delay IAT]",
        }
    }

    fn terminator_name(self) -> &'static str {
        match self {
            Self::ImportLookup => "null terminator",
            Self::DelayName => "INT null terminator",
            Self::DelayAddress => "IAT null terminator",
        }
    }
}

/// What an import thunk slot refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThunkTarget {
    ByName { hint: u16, name: String },
    ByOrdinal(u16),
    NullTerminator,
}

/// Records found in the fixed PE data directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeSymbol {
    Directory {
        rva: u32,
        size: u32,
        name: String,
    },
    ImportDescriptor {
        rva: u32,
        size: u32,
        /// Imported module, or `null terminator` for the closing entry.
        module: String,
        /// Delay-load descriptors are 32 bytes, regular ones 20.
        delay_load: bool,
    },
    ImportThunk {
        rva: u32,
        size: u32,
        module: String,
        table: ThunkTable,
        target: ThunkTarget,
    },
    ImportByName {
        rva: u32,
        size: u32,
        hint: u16,
        module: String,
        name: String,
    },
    ImportString {
        rva: u32,
        size: u32,
        value: String,
    },
    LoadConfigTable {
        rva: u32,
        size: u32,
        kind: LoadConfigTableKind,
    },
    DebugData {
        rva: u32,
        size: u32,
        debug_type: DebugType,
    },
}

impl PeSymbol {
    pub fn rva(&self) -> u32 {
        match self {
            Self::Directory { rva, .. }
            | Self::ImportDescriptor { rva, .. }
            | Self::ImportThunk { rva, .. }
            | Self::ImportByName { rva, .. }
            | Self::ImportString { rva, .. }
            | Self::LoadConfigTable { rva, .. }
            | Self::DebugData { rva, .. } => *rva,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::Directory { size, .. }
            | Self::ImportDescriptor { size, .. }
            | Self::ImportThunk { size, .. }
            | Self::ImportByName { size, .. }
            | Self::ImportString { size, .. }
            | Self::LoadConfigTable { size, .. }
            | Self::DebugData { size, .. } => *size,
        }
    }

    pub fn range(&self) -> RvaRange {
        RvaRange::from_rva_and_size(self.rva(), self.size())
    }

    pub fn name(&self) -> String {
        match self {
            Self::Directory { name, .. } => name.clone(),
            Self::ImportDescriptor {
                module, delay_load, ..
            } => {
                if *delay_load {
                    format!("[delay import descriptor] {module}")
                } else {
                    format!("[import descriptor] {module}")
                }
            }
            Self::ImportThunk {
                module,
                table,
                target,
                ..
            } => match target {
                ThunkTarget::ByName { name, .. } => format!("{} {module}!{name}", table.prefix()),
                ThunkTarget::ByOrdinal(ordinal) => format!("{} {module}!#{ordinal}", table.prefix()),
                ThunkTarget::NullTerminator => table.terminator_name().to_string(),
            },
            Self::ImportByName { module, name, .. } => format!("[import name] {module}!{name}"),
            Self::ImportString { value, .. } => format!("`string': \"{value}\""),
            Self::LoadConfigTable { kind, .. } => kind.name().to_string(),
            Self::DebugData { debug_type, .. } => format!("[Debug Directory] {}", debug_type.name()),
        }
    }
}

/// An icon or cursor image reconstructed from its group directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsrcImage {
    pub rva: u32,
    pub size: u32,
    /// `ICON` or `CURSOR`.
    pub type_name: &'static str,
    /// `#<id>` of the member resource.
    pub name: String,
    pub language: String,
    pub width: u16,
    pub height: u16,
    pub bits_per_pixel: u16,
}

impl RsrcImage {
    pub fn display_name(&self) -> String {
        format!(
            "Resource '{}' ({}, {}) {}x{} {}bpp",
            self.name, self.type_name, self.language, self.width, self.height, self.bits_per_pixel
        )
    }
}

/// One STRINGTABLE leaf (a block of up to 16 strings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub rva: u32,
    pub size: u32,
    pub name: String,
    pub language: String,
    pub strings: Vec<String>,
}

impl StringTable {
    pub fn end(&self) -> u32 {
        self.rva.saturating_add(self.size)
    }
}

/// Records found while walking the resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsrcSymbol {
    Directory {
        rva: u32,
        size: u32,
        depth: u32,
        type_name: String,
        name: Option<String>,
    },
    DataEntry {
        rva: u32,
        depth: u32,
        type_name: String,
        name: String,
        language: String,
    },
    String {
        rva: u32,
        size: u32,
        value: String,
    },
    Data {
        rva: u32,
        size: u32,
        type_name: String,
        name: String,
        language: String,
    },
    GroupIcon {
        rva: u32,
        size: u32,
        name: String,
        language: String,
        icons: Vec<RsrcImage>,
    },
    GroupCursor {
        rva: u32,
        size: u32,
        name: String,
        language: String,
        cursors: Vec<RsrcImage>,
    },
    StringTableGroup {
        rva: u32,
        size: u32,
        language: String,
        tables: Vec<StringTable>,
    },
}

/// Size of IMAGE_RESOURCE_DATA_ENTRY.
pub const RSRC_DATA_ENTRY_SIZE: u32 = 16;

impl RsrcSymbol {
    pub fn rva(&self) -> u32 {
        match self {
            Self::Directory { rva, .. }
            | Self::DataEntry { rva, .. }
            | Self::String { rva, .. }
            | Self::Data { rva, .. }
            | Self::GroupIcon { rva, .. }
            | Self::GroupCursor { rva, .. }
            | Self::StringTableGroup { rva, .. } => *rva,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::DataEntry { .. } => RSRC_DATA_ENTRY_SIZE,
            Self::Directory { size, .. }
            | Self::String { size, .. }
            | Self::Data { size, .. }
            | Self::GroupIcon { size, .. }
            | Self::GroupCursor { size, .. }
            | Self::StringTableGroup { size, .. } => *size,
        }
    }

    pub fn range(&self) -> RvaRange {
        RvaRange::from_rva_and_size(self.rva(), self.size())
    }

    /// True for the resource payload itself, false for directory metadata.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Data { .. } | Self::GroupIcon { .. } | Self::GroupCursor { .. } | Self::StringTableGroup { .. }
        )
    }

    pub fn name(&self) -> String {
        match self {
            Self::Directory {
                depth: 0, ..
            } => "[rsrc directory] L0 (Root)".to_string(),
            Self::Directory {
                depth: 1,
                type_name,
                ..
            } => format!("[rsrc directory] L1 ({type_name})"),
            Self::Directory {
                depth,
                type_name,
                name,
                ..
            } => format!(
                "[rsrc directory] L{depth} ({type_name}, {})",
                name.as_deref().unwrap_or("unknown name")
            ),
            Self::DataEntry {
                depth,
                type_name,
                name,
                language,
                ..
            } => format!("[rsrc data entry] L{depth} ({type_name}, {name}, {language})"),
            Self::String { value, .. } => format!("[rsrc string] \"{value}\""),
            Self::Data {
                type_name,
                name,
                language,
                ..
            } => format!("Resource '{name}' ({type_name}, {language})"),
            Self::GroupIcon { name, language, .. } => format!("Resource '{name}' (GROUP_ICON, {language})"),
            Self::GroupCursor { name, language, .. } => {
                format!("Resource '{name}' (GROUP_CURSOR, {language})")
            }
            Self::StringTableGroup {
                language, tables, ..
            } => match (tables.first(), tables.last()) {
                (Some(first), Some(last)) if tables.len() > 1 => format!(
                    "Resource '{}'-'{}' (STRINGTABLE, {language})",
                    first.name, last.name
                ),
                (Some(only), _) => format!("Resource '{}' (STRINGTABLE, {language})", only.name),
                _ => format!("Resource (STRINGTABLE, {language})"),
            },
        }
    }
}

/// Render `"<prefix> <target name>"` for an exception-handling record.
fn eh_name<P: SymbolProvider + ?Sized>(prefix: &str, target_start_rva: u32, provider: &P) -> String {
    match target_symbol(provider, target_start_rva) {
        Some(symbol) => format!("{prefix} {}", symbol.name),
        None => format!("{prefix} <unnamed code at 0x{target_start_rva:X}>"),
    }
}

/// Shape of a PDATA record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdataKind {
    /// Points at an UNWIND_INFO / XDATA record.
    Plain { unwind_info_rva: u32 },
    /// ARM linker forwarder pointing at another PDATA record.
    Forwarder,
    /// ARM packed unwind data; no XDATA exists.
    PackedUnwindData,
}

/// One function-level unwind record of the exception directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdataSymbol {
    pub kind: PdataKind,
    /// RVA of the PDATA record itself.
    pub rva: u32,
    pub size: u32,
    /// Start of the function the record describes.
    pub target_start_rva: u32,
}

impl PdataSymbol {
    pub fn range(&self) -> RvaRange {
        RvaRange::from_rva_and_size(self.rva, self.size)
    }

    pub fn unwind_info_rva(&self) -> Option<u32> {
        match self.kind {
            PdataKind::Plain { unwind_info_rva } => Some(unwind_info_rva),
            PdataKind::Forwarder | PdataKind::PackedUnwindData => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self.kind {
            PdataKind::Plain { .. } => "[pdata]",
            PdataKind::Forwarder => "[pdata forwarder]",
            PdataKind::PackedUnwindData => "[pdata packed]",
        }
    }

    /// The code symbol this record describes.
    pub fn target<P: SymbolProvider + ?Sized>(&self, provider: &P) -> Option<CodeSymbol> {
        target_symbol(provider, self.target_start_rva)
    }

    pub fn name<P: SymbolProvider + ?Sized>(&self, provider: &P) -> String {
        eh_name(self.prefix(), self.target_start_rva, provider)
    }
}

/// What an XDATA record contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XdataKind {
    UnwindInfo,
    ChainUnwindInfo,
    CppXdata,
    StateUnwindMap,
    TryMap,
    HandlerMap,
    IpToStateMap,
    SeparatedIpToStateMap,
}

impl XdataKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::UnwindInfo => "[unwind]",
            Self::ChainUnwindInfo => "[chain-unwind]",
            Self::CppXdata => "[cppxdata]",
            Self::StateUnwindMap => "[stateUnwindMap]",
            Self::TryMap => "[tryMap]",
            Self::HandlerMap => "[handlerMap]",
            Self::IpToStateMap => "[ip2state]",
            Self::SeparatedIpToStateMap => "[sepIp2state]",
        }
    }
}

/// An unwind or C++ EH metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdataSymbol {
    pub kind: XdataKind,
    pub rva: u32,
    pub size: u32,
    pub target_start_rva: u32,
}

impl XdataSymbol {
    pub fn new(kind: XdataKind, target_start_rva: u32, rva: u32, size: u32) -> Self {
        Self {
            kind,
            rva,
            size,
            target_start_rva,
        }
    }

    pub fn range(&self) -> RvaRange {
        RvaRange::from_rva_and_size(self.rva, self.size)
    }

    pub fn target<P: SymbolProvider + ?Sized>(&self, provider: &P) -> Option<CodeSymbol> {
        target_symbol(provider, self.target_start_rva)
    }

    pub fn name<P: SymbolProvider + ?Sized>(&self, provider: &P) -> String {
        eh_name(self.kind.prefix(), self.target_start_rva, provider)
    }
}

/// PDATA records keyed by their own RVA.
pub type PdataTable = BTreeMap<u32, PdataSymbol>;

/// XDATA records keyed by RVA. The first record inserted at an RVA wins;
/// later inserts at the same RVA are ignored, since shared or folded
/// functions reach the same XDATA from several PDATA entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XdataTable {
    symbols: BTreeMap<u32, XdataSymbol>,
}

impl XdataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a record already exists at the same RVA. Returns
    /// whether the record was added.
    pub fn insert(&mut self, symbol: XdataSymbol) -> bool {
        match self.symbols.entry(symbol.rva) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(symbol);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, rva: u32) -> bool {
        self.symbols.contains_key(&rva)
    }

    pub fn get(&self, rva: u32) -> Option<&XdataSymbol> {
        self.symbols.get(&rva)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &XdataSymbol> {
        self.symbols.values()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, u32, XdataSymbol> {
        self.symbols.iter()
    }

    pub fn into_map(self) -> BTreeMap<u32, XdataSymbol> {
        self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SourceLanguage;

    struct OneFunction;

    impl SymbolProvider for OneFunction {
        fn resolve_code_symbol_at(&self, rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
            (0x1000..0x1100)
                .contains(&rva)
                .then(|| CodeSymbol::new(0x1000, 0x100, "DllMain"))
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

    #[test]
    fn xdata_insert_is_first_writer_wins() {
        let mut table = XdataTable::new();
        assert!(table.insert(XdataSymbol::new(XdataKind::UnwindInfo, 0x1000, 0x5000, 8)));
        assert!(!table.insert(XdataSymbol::new(XdataKind::CppXdata, 0x2000, 0x5000, 40)));
        assert_eq!(table.len(), 1);
        let kept = table.get(0x5000).unwrap();
        assert_eq!(kept.kind, XdataKind::UnwindInfo);
        assert_eq!(kept.size, 8);
    }

    #[test]
    fn eh_names_resolve_lazily() {
        let sym = XdataSymbol::new(XdataKind::ChainUnwindInfo, 0x1010, 0x5000, 20);
        assert_eq!(sym.name(&OneFunction), "[chain-unwind] DllMain");

        let orphan = PdataSymbol {
            kind: PdataKind::Plain { unwind_info_rva: 0x5000 },
            rva: 0x3000,
            size: 12,
            target_start_rva: 0x2ABC,
        };
        assert_eq!(orphan.name(&OneFunction), "[pdata] <unnamed code at 0x2ABC>");
        assert!(orphan.target(&OneFunction).is_none());
    }

    #[test]
    fn rsrc_names() {
        let dir = RsrcSymbol::Directory {
            rva: 0x100,
            size: 24,
            depth: 2,
            type_name: "ICON".into(),
            name: None,
        };
        assert_eq!(dir.name(), "[rsrc directory] L2 (ICON, unknown name)");

        let entry = RsrcSymbol::DataEntry {
            rva: 0x200,
            depth: 2,
            type_name: "MENU".into(),
            name: "#104".into(),
            language: "LANG_NEUTRAL".into(),
        };
        assert_eq!(entry.size(), 16);
        assert_eq!(entry.name(), "[rsrc data entry] L2 (MENU, #104, LANG_NEUTRAL)");
        assert!(!entry.is_data());
    }

    #[test]
    fn import_names() {
        let thunk = PeSymbol::ImportThunk {
            rva: 0x10,
            size: 8,
            module: "ws2_32.dll".into(),
            table: ThunkTable::ImportLookup,
            target: ThunkTarget::ByOrdinal(7),
        };
        assert_eq!(thunk.name(), "[import thunk] ws2_32.dll!#7");
        let end = PeSymbol::ImportThunk {
            rva: 0x18,
            size: 8,
            module: "ws2_32.dll".into(),
            table: ThunkTable::DelayAddress,
            target: ThunkTarget::NullTerminator,
        };
        assert_eq!(end.name(), "IAT null terminator");
        let string = PeSymbol::ImportString {
            rva: 0x20,
            size: 13,
            value: "kernel32.dll".into(),
        };
        assert_eq!(string.name(), "`string': \"kernel32.dll\"");
        assert_eq!(string.range(), RvaRange::new(0x20, 0x2D));
    }
}
