//! Resource directory walking.
//!
//! The resource directory contains embedded resources like icons, version info,
//! manifests, dialogs, and other application data. By convention it is a
//! three level tree (type, name, language); deeper trees are not navigated.
//!
//! Icons and cursors are reported through their GROUP_ICON / GROUP_CURSOR
//! resources, since that is the unit a developer adds to a resource script.
//! STRINGTABLE blocks that the resource compiler laid out back to back are
//! merged into one group.

use std::collections::btree_map::{self, BTreeMap};

use tracing::{debug, debug_span, trace};

use crate::config::align8;
use crate::data_dir::DataDirectoryType;
use crate::headers::ImageInfo;
use crate::range::RvaRange;
use crate::reader::ImageView;
use crate::symbol::{RsrcImage, RsrcSymbol, StringTable};
use crate::{Error, Result};

/// Deepest directory level that is walked (0 is the root).
pub const MAX_RESOURCE_DEPTH: u32 = 2;

/// Standard resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResourceType {
    Cursor = 1,
    Bitmap = 2,
    Icon = 3,
    Menu = 4,
    Dialog = 5,
    StringTable = 6,
    FontDir = 7,
    Font = 8,
    Accelerator = 9,
    RcData = 10,
    MessageTable = 11,
    GroupCursor = 12,
    GroupIcon = 14,
    Version = 16,
    DlgInclude = 17,
    PlugPlay = 19,
    Vxd = 20,
    AniCursor = 21,
    AniIcon = 22,
    Html = 23,
    Manifest = 24,
}

impl ResourceType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Cursor),
            2 => Some(Self::Bitmap),
            3 => Some(Self::Icon),
            4 => Some(Self::Menu),
            5 => Some(Self::Dialog),
            6 => Some(Self::StringTable),
            7 => Some(Self::FontDir),
            8 => Some(Self::Font),
            9 => Some(Self::Accelerator),
            10 => Some(Self::RcData),
            11 => Some(Self::MessageTable),
            12 => Some(Self::GroupCursor),
            14 => Some(Self::GroupIcon),
            16 => Some(Self::Version),
            17 => Some(Self::DlgInclude),
            19 => Some(Self::PlugPlay),
            20 => Some(Self::Vxd),
            21 => Some(Self::AniCursor),
            22 => Some(Self::AniIcon),
            23 => Some(Self::Html),
            24 => Some(Self::Manifest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cursor => "CURSOR",
            Self::Bitmap => "BITMAP",
            Self::Icon => "ICON",
            Self::Menu => "MENU",
            Self::Dialog => "DIALOG",
            Self::StringTable => "STRINGTABLE",
            Self::FontDir => "FONTDIR",
            Self::Font => "FONT",
            Self::Accelerator => "ACCELERATOR",
            Self::RcData => "RCDATA",
            Self::MessageTable => "MESSAGETABLE",
            Self::GroupCursor => "GROUP_CURSOR",
            Self::GroupIcon => "GROUP_ICON",
            Self::Version => "VERSION",
            Self::DlgInclude => "DLGINCLUDE",
            Self::PlugPlay => "PLUGPLAY",
            Self::Vxd => "VXD",
            Self::AniCursor => "ANICURSOR",
            Self::AniIcon => "ANIICON",
            Self::Html => "HTML",
            Self::Manifest => "MANIFEST",
        }
    }
}

/// Display label for a resource language ID.
pub fn language_name(lcid: u16) -> &'static str {
    match lcid {
        0x0000 | 0x0400 => "LANG_NEUTRAL",
        0x007F => "Invariant Language (Invariant Country)",
        0x0401 => "Arabic (Saudi Arabia)",
        0x0402 => "Bulgarian (Bulgaria)",
        0x0403 => "Catalan (Spain)",
        0x0404 => "Chinese (Traditional, Taiwan)",
        0x0405 => "Czech (Czechia)",
        0x0406 => "Danish (Denmark)",
        0x0407 => "German (Germany)",
        0x0408 => "Greek (Greece)",
        0x0409 => "English (United States)",
        0x040A => "Spanish (Spain, Traditional Sort)",
        0x040B => "Finnish (Finland)",
        0x040C => "French (France)",
        0x040D => "Hebrew (Israel)",
        0x040E => "Hungarian (Hungary)",
        0x0410 => "Italian (Italy)",
        0x0411 => "Japanese (Japan)",
        0x0412 => "Korean (Korea)",
        0x0413 => "Dutch (Netherlands)",
        0x0414 => "Norwegian Bokmål (Norway)",
        0x0415 => "Polish (Poland)",
        0x0416 => "Portuguese (Brazil)",
        0x0418 => "Romanian (Romania)",
        0x0419 => "Russian (Russia)",
        0x041A => "Croatian (Croatia)",
        0x041B => "Slovak (Slovakia)",
        0x041D => "Swedish (Sweden)",
        0x041E => "Thai (Thailand)",
        0x041F => "Turkish (Turkey)",
        0x0421 => "Indonesian (Indonesia)",
        0x0422 => "Ukrainian (Ukraine)",
        0x0424 => "Slovenian (Slovenia)",
        0x0425 => "Estonian (Estonia)",
        0x0426 => "Latvian (Latvia)",
        0x0427 => "Lithuanian (Lithuania)",
        0x042A => "Vietnamese (Vietnam)",
        0x0439 => "Hindi (India)",
        0x0804 => "Chinese (Simplified, China)",
        0x0807 => "German (Switzerland)",
        0x0809 => "English (United Kingdom)",
        0x080A => "Spanish (Mexico)",
        0x080C => "French (Belgium)",
        0x0813 => "Dutch (Belgium)",
        0x0816 => "Portuguese (Portugal)",
        0x0C04 => "Chinese (Traditional, Hong Kong SAR)",
        0x0C07 => "German (Austria)",
        0x0C09 => "English (Australia)",
        0x0C0A => "Spanish (Spain)",
        0x0C0C => "French (Canada)",
        0x1009 => "English (Canada)",
        0x100C => "French (Switzerland)",
        _ => "Unknown language",
    }
}

/// IMAGE_RESOURCE_DIRECTORY - 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryHeader {
    /// Number of named entries.
    pub number_of_named_entries: u16,
    /// Number of ID entries.
    pub number_of_id_entries: u16,
}

impl ResourceDirectoryHeader {
    pub const SIZE: u32 = 16;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            number_of_named_entries: image.read_u16_at(rva.saturating_add(12))?,
            number_of_id_entries: image.read_u16_at(rva.saturating_add(14))?,
        })
    }

    pub fn total_entries(&self) -> u32 {
        u32::from(self.number_of_named_entries) + u32::from(self.number_of_id_entries)
    }

    /// Bytes covered by the header and its entry array.
    pub fn directory_size(&self) -> u32 {
        Self::SIZE + ResourceDirectoryEntry::SIZE * self.total_entries()
    }
}

/// IMAGE_RESOURCE_DIRECTORY_ENTRY - 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDirectoryEntry {
    /// Name offset (high bit set) or ID.
    pub name_or_id: u32,
    /// Offset to data or subdirectory (high bit set = subdirectory).
    pub offset_to_data: u32,
}

impl ResourceDirectoryEntry {
    pub const SIZE: u32 = 8;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            name_or_id: image.read_u32_at(rva)?,
            offset_to_data: image.read_u32_at(rva.saturating_add(4))?,
        })
    }

    /// Check if this entry has a string name (vs numeric ID).
    pub fn is_named(&self) -> bool {
        (self.name_or_id & 0x80000000) != 0
    }

    /// Get the name offset (only valid if is_named() is true).
    pub fn name_offset(&self) -> u32 {
        self.name_or_id & 0x7FFFFFFF
    }

    /// Get the ID (only valid if is_named() is false).
    pub fn id(&self) -> u16 {
        self.name_or_id as u16
    }

    /// Check if this points to a subdirectory (vs data entry).
    pub fn is_directory(&self) -> bool {
        (self.offset_to_data & 0x80000000) != 0
    }

    /// Get the offset to subdirectory or data entry.
    pub fn data_offset(&self) -> u32 {
        self.offset_to_data & 0x7FFFFFFF
    }
}

/// IMAGE_RESOURCE_DATA_ENTRY - 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceDataEntry {
    /// RVA of the resource data.
    pub offset_to_data: u32,
    /// Size of the resource data.
    pub size: u32,
    /// Code page.
    pub code_page: u32,
}

impl ResourceDataEntry {
    pub const SIZE: u32 = 16;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            offset_to_data: image.read_u32_at(rva)?,
            size: image.read_u32_at(rva.saturating_add(4))?,
            code_page: image.read_u32_at(rva.saturating_add(8))?,
        })
    }
}

/// NEWHEADER preceding the entries of a GROUP_ICON / GROUP_CURSOR.
const GROUP_HEADER_SIZE: u32 = 6;
/// ICONRESDIR / CURSORRESDIR entry size.
const GROUP_ENTRY_SIZE: u32 = 14;

/// Type of the subtree being walked.
#[derive(Debug, Clone)]
struct TypeLabel {
    kind: Option<ResourceType>,
    name: String,
}

impl TypeLabel {
    fn root() -> Self {
        Self {
            kind: None,
            name: "Unknown".to_string(),
        }
    }
}

/// All symbols found in the resource directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSymbols {
    pub symbols: BTreeMap<u32, RsrcSymbol>,
    /// Extent of the resource directory.
    pub range: RvaRange,
}

impl ResourceSymbols {
    pub fn get(&self, rva: u32) -> Option<&RsrcSymbol> {
        self.symbols.get(&rva)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Resource payloads, leaving out directory metadata.
    pub fn data(&self) -> impl Iterator<Item = &RsrcSymbol> {
        self.symbols.values().filter(|s| s.is_data())
    }
}

struct Walker<'a, 'i> {
    image: &'i ImageView<'a>,
    base: u32,
    symbols: BTreeMap<u32, RsrcSymbol>,
    string_tables: BTreeMap<u32, StringTable>,
}

/// Walk the resource directory of the image.
pub fn walk_resources(image: &ImageView<'_>, info: &ImageInfo) -> Result<ResourceSymbols> {
    let dir = info.directory(DataDirectoryType::Resource);
    if dir.virtual_address == 0 {
        return Ok(ResourceSymbols::default());
    }

    let _span = debug_span!("Parsing RSRC", rva = dir.virtual_address).entered();
    let mut walker = Walker {
        image,
        base: dir.virtual_address,
        symbols: BTreeMap::new(),
        string_tables: BTreeMap::new(),
    };
    walker.walk_directory(dir.virtual_address, 0, &TypeLabel::root(), None)?;
    walker.group_string_tables();
    debug!(symbols = walker.symbols.len(), "RSRC parsed");

    Ok(ResourceSymbols {
        symbols: walker.symbols,
        range: RvaRange::from_rva_and_size(dir.virtual_address, dir.size),
    })
}

impl Walker<'_, '_> {
    fn insert(&mut self, symbol: RsrcSymbol) {
        if let btree_map::Entry::Vacant(slot) = self.symbols.entry(symbol.rva()) {
            slot.insert(symbol);
        }
    }

    /// Name of an entry: its string when named, `#<id>` otherwise.
    fn entry_name(&self, entry: &ResourceDirectoryEntry) -> Result<String> {
        if entry.is_named() {
            let rva = self.base.saturating_add(entry.name_offset());
            let len = self.image.read_u16_at(rva)?;
            self.image.read_utf16_at(rva.saturating_add(2), usize::from(len))
        } else {
            Ok(format!("#{}", entry.id()))
        }
    }

    fn walk_directory(&mut self, rva: u32, depth: u32, ty: &TypeLabel, name: Option<&str>) -> Result<()> {
        if depth > MAX_RESOURCE_DEPTH {
            debug!(rva, depth, "resource tree deeper than expected, not descending");
            return Ok(());
        }

        let header = ResourceDirectoryHeader::read(self.image, rva)?;
        self.insert(RsrcSymbol::Directory {
            rva,
            size: header.directory_size(),
            depth,
            type_name: ty.name.clone(),
            name: name.map(str::to_string),
        });

        for i in 0..header.total_entries() {
            let entry_rva = rva
                .saturating_add(ResourceDirectoryHeader::SIZE)
                .saturating_add(i * ResourceDirectoryEntry::SIZE);
            let entry = ResourceDirectoryEntry::read(self.image, entry_rva)?;

            let entry_name = self.entry_name(&entry)?;
            if entry.is_named() {
                let string_rva = self.base.saturating_add(entry.name_offset());
                self.insert(RsrcSymbol::String {
                    rva: string_rva,
                    size: 2 + 2 * entry_name.encode_utf16().count() as u32,
                    value: entry_name.clone(),
                });
            }

            let target = self.base.saturating_add(entry.data_offset());
            if entry.is_directory() {
                match depth {
                    0 => {
                        let kind = if entry.is_named() {
                            None
                        } else {
                            ResourceType::from_u16(entry.id())
                        };
                        let child_type = TypeLabel {
                            kind,
                            name: kind.map_or(entry_name, |k| k.name().to_string()),
                        };
                        self.walk_directory(target, depth + 1, &child_type, None)?;
                    }
                    1 => self.walk_directory(target, depth + 1, ty, Some(&entry_name))?,
                    _ => self.walk_directory(target, depth + 1, ty, name)?,
                }
            } else {
                let language = if entry.is_named() {
                    entry_name
                } else {
                    language_name(entry.id()).to_string()
                };
                self.data_leaf(target, depth, ty, name.unwrap_or("<unknown rsrc name>"), language)?;
            }
        }

        Ok(())
    }

    fn data_leaf(&mut self, rva: u32, depth: u32, ty: &TypeLabel, name: &str, language: String) -> Result<()> {
        let data = ResourceDataEntry::read(self.image, rva)?;
        trace!(rva, data = data.offset_to_data, size = data.size, kind = %ty.name, "resource data entry");
        self.insert(RsrcSymbol::DataEntry {
            rva,
            depth,
            type_name: ty.name.clone(),
            name: name.to_string(),
            language: language.clone(),
        });

        match ty.kind {
            Some(ResourceType::Icon) | Some(ResourceType::Cursor) => {}
            Some(ResourceType::GroupIcon) => {
                let (rva, size, icons) = self.image_group(&data, ResourceType::Icon, &language)?;
                self.insert(RsrcSymbol::GroupIcon {
                    rva,
                    size,
                    name: name.to_string(),
                    language,
                    icons,
                });
            }
            Some(ResourceType::GroupCursor) => {
                let (rva, size, cursors) = self.image_group(&data, ResourceType::Cursor, &language)?;
                self.insert(RsrcSymbol::GroupCursor {
                    rva,
                    size,
                    name: name.to_string(),
                    language,
                    cursors,
                });
            }
            Some(ResourceType::StringTable) => {
                let table = StringTable {
                    rva: data.offset_to_data,
                    size: data.size,
                    name: name.to_string(),
                    language,
                    strings: self.read_string_table(&data)?,
                };
                self.string_tables.entry(table.rva).or_insert(table);
            }
            _ => self.insert(RsrcSymbol::Data {
                rva: data.offset_to_data,
                size: data.size,
                type_name: ty.name.clone(),
                name: name.to_string(),
                language,
            }),
        }

        Ok(())
    }

    /// Reconstruct the members of a GROUP_ICON or GROUP_CURSOR. The member
    /// images were written before the group header, each 8-byte aligned, so
    /// their RVAs are recovered by walking the entries backwards.
    fn image_group(
        &self,
        data: &ResourceDataEntry,
        member: ResourceType,
        language: &str,
    ) -> Result<(u32, u32, Vec<RsrcImage>)> {
        let group_rva = data.offset_to_data;
        let count = u32::from(self.image.read_u16_at(group_rva.saturating_add(4))?);

        let mut members = Vec::with_capacity(count as usize);
        let mut total = GROUP_HEADER_SIZE + GROUP_ENTRY_SIZE * count;
        let mut cursor = group_rva;

        for idx in (0..count).rev() {
            let entry = group_rva
                .saturating_add(GROUP_HEADER_SIZE)
                .saturating_add(idx * GROUP_ENTRY_SIZE);
            let bits_per_pixel = self.image.read_u16_at(entry.saturating_add(6))?;
            let bytes_in_res = self.image.read_u32_at(entry.saturating_add(8))?;
            let id = self.image.read_u16_at(entry.saturating_add(12))?;

            let (width, height) = if member == ResourceType::Icon {
                let width = self.image.read_u8_at(entry)?;
                let height = self.image.read_u8_at(entry.saturating_add(1))?;
                (icon_dimension(width), icon_dimension(height))
            } else {
                let width = self.image.read_u16_at(entry)?;
                // Cursor bitmaps store the AND mask below the image.
                let height = self.image.read_u16_at(entry.saturating_add(2))? / 2;
                (width, height)
            };

            let aligned = align8(bytes_in_res);
            cursor = cursor
                .checked_sub(aligned)
                .ok_or_else(|| Error::out_of_bounds(u64::from(cursor), aligned as usize, self.image.size()))?;
            total = total.saturating_add(aligned);

            members.push(RsrcImage {
                rva: cursor,
                size: bytes_in_res,
                type_name: member.name(),
                name: format!("#{id}"),
                language: language.to_string(),
                width,
                height,
                bits_per_pixel,
            });
        }
        members.reverse();

        let rva = members.first().map_or(group_rva, |m| m.rva);
        Ok((rva, total, members))
    }

    fn read_string_table(&self, data: &ResourceDataEntry) -> Result<Vec<String>> {
        let end = data.offset_to_data.saturating_add(data.size);
        let mut cursor = self.image.cursor(data.offset_to_data);
        let mut strings = Vec::new();

        while cursor.position() < end {
            let len = cursor.read_u16()?;
            if len == 0 {
                continue;
            }
            strings.push(self.image.read_utf16_at(cursor.position(), usize::from(len))?);
            cursor.skip(u32::from(len) * 2)?;
        }

        Ok(strings)
    }

    /// Merge adjacent string tables of one language into groups.
    fn group_string_tables(&mut self) {
        let tables = std::mem::take(&mut self.string_tables);
        let mut run: Vec<StringTable> = Vec::new();

        for table in tables.into_values() {
            let continues = run
                .last()
                .map_or(true, |last| align8(last.end()) == table.rva && last.language == table.language);
            if !continues {
                self.emit_string_table_group(std::mem::take(&mut run));
            }
            run.push(table);
        }
        self.emit_string_table_group(run);
    }

    fn emit_string_table_group(&mut self, tables: Vec<StringTable>) {
        let (Some(first), Some(last)) = (tables.first(), tables.last()) else {
            return;
        };
        let rva = first.rva;
        let size = last.end().saturating_sub(rva);
        let language = first.language.clone();
        self.insert(RsrcSymbol::StringTableGroup {
            rva,
            size,
            language,
            tables,
        });
    }
}

fn icon_dimension(value: u8) -> u16 {
    if value == 0 {
        256
    } else {
        u16::from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_directory_entry_flags() {
        let entry = ResourceDirectoryEntry {
            name_or_id: 0x8000_0010,
            offset_to_data: 0x8000_0020,
        };
        assert!(entry.is_named());
        assert!(entry.is_directory());
        assert_eq!(entry.name_offset(), 0x10);
        assert_eq!(entry.data_offset(), 0x20);

        let entry = ResourceDirectoryEntry {
            name_or_id: 0x0409,
            offset_to_data: 0x30,
        };
        assert!(!entry.is_named());
        assert!(!entry.is_directory());
        assert_eq!(entry.id(), 0x0409);
    }

    #[test]
    fn test_resource_type_names() {
        assert_eq!(ResourceType::from_u16(6).map(|t| t.name()), Some("STRINGTABLE"));
        assert_eq!(ResourceType::from_u16(14), Some(ResourceType::GroupIcon));
        assert_eq!(ResourceType::from_u16(13), None);
    }

    #[test]
    fn test_language_names() {
        assert_eq!(language_name(0), "LANG_NEUTRAL");
        assert_eq!(language_name(0x400), "LANG_NEUTRAL");
        assert_eq!(language_name(0x409), "English (United States)");
        assert_eq!(language_name(0x1234), "Unknown language");
    }

    #[test]
    fn test_directory_size() {
        let header = ResourceDirectoryHeader {
            number_of_named_entries: 1,
            number_of_id_entries: 2,
        };
        assert_eq!(header.directory_size(), 40);
    }

    #[test]
    fn test_icon_dimension() {
        assert_eq!(icon_dimension(0), 256);
        assert_eq!(icon_dimension(32), 32);
    }
}
