//! Load configuration directory parsing.
//!
//! Only the Control Flow Guard tables are of interest: the guard CF function
//! table (GFIDS) and the address-taken IAT entry table (GIATS). Each table
//! entry is a 4-byte RVA followed by a number of metadata bytes encoded in
//! the top nibble of `GuardFlags`.

use tracing::{debug, trace};

use crate::directory::DirectorySymbols;
use crate::reader::ImageView;
use crate::symbol::{LoadConfigTableKind, PeSymbol};
use crate::Result;

/// Mask of the stride nibble in `GuardFlags`.
pub const CF_FUNCTION_TABLE_SIZE_MASK: u32 = 0xF000_0000;
/// Shift of the stride nibble in `GuardFlags`.
pub const CF_FUNCTION_TABLE_SIZE_SHIFT: u32 = 28;

/// Field offsets of the CFG members for one pointer width.
#[derive(Debug, Clone, Copy)]
struct GuardLayout {
    /// Directory size that includes GuardCFFunctionTable/Count/GuardFlags.
    v2_size: u32,
    gfids_table: u32,
    gfids_count: u32,
    guard_flags: u32,
    /// Directory size that includes GuardAddressTakenIatEntryTable/Count.
    v3_size: u32,
    giats_table: u32,
    giats_count: u32,
}

const LAYOUT_32: GuardLayout = GuardLayout {
    v2_size: 92,
    gfids_table: 80,
    gfids_count: 84,
    guard_flags: 88,
    // The 12-byte CodeIntegrity block follows GuardFlags.
    v3_size: 112,
    giats_table: 104,
    giats_count: 108,
};

const LAYOUT_64: GuardLayout = GuardLayout {
    v2_size: 148,
    gfids_table: 128,
    gfids_count: 136,
    guard_flags: 144,
    v3_size: 176,
    giats_table: 160,
    giats_count: 168,
};

/// CFG table pointers recovered from the load config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuardTables {
    pub guard_flags: u32,
    pub gfids_va: u64,
    pub gfids_count: u64,
    pub giats_va: u64,
    pub giats_count: u64,
}

impl GuardTables {
    /// Read the CFG fields that fit into a directory of `size` bytes.
    pub fn read(image: &ImageView<'_>, rva: u32, size: u32, pointer_size: u32) -> Result<Self> {
        let layout = if pointer_size == 8 { LAYOUT_64 } else { LAYOUT_32 };
        let mut tables = Self::default();

        let mut has_v2 = size >= layout.v2_size;
        if pointer_size != 8 && has_v2 {
            // The 32-bit struct carries its own size, which must agree.
            has_v2 = image.read_u32_at(rva)? >= layout.v2_size;
        }
        if !has_v2 {
            return Ok(tables);
        }

        let field = |offset: u32| rva.saturating_add(offset);
        tables.gfids_va = image.read_pointer_at(field(layout.gfids_table), pointer_size)?;
        tables.gfids_count = image.read_pointer_at(field(layout.gfids_count), pointer_size)?;
        tables.guard_flags = image.read_u32_at(field(layout.guard_flags))?;

        if size >= layout.v3_size {
            tables.giats_va = image.read_pointer_at(field(layout.giats_table), pointer_size)?;
            tables.giats_count = image.read_pointer_at(field(layout.giats_count), pointer_size)?;
        }

        Ok(tables)
    }

    /// Bytes per table entry: a 4-byte RVA plus the metadata bytes.
    pub fn stride(&self) -> u32 {
        4 + ((self.guard_flags & CF_FUNCTION_TABLE_SIZE_MASK) >> CF_FUNCTION_TABLE_SIZE_SHIFT)
    }
}

fn table_symbol(
    kind: LoadConfigTableKind,
    va: u64,
    count: u64,
    stride: u32,
    preferred_base: u64,
) -> Option<PeSymbol> {
    if va == 0 || count == 0 {
        return None;
    }
    let rva = u32::try_from(va.checked_sub(preferred_base)?).ok()?;
    let size = u32::try_from(count.checked_mul(u64::from(stride))?).ok()?;
    Some(PeSymbol::LoadConfigTable { rva, size, kind })
}

pub(crate) fn read_load_config(
    image: &ImageView<'_>,
    rva: u32,
    size: u32,
    pointer_size: u32,
    preferred_base: u64,
    out: &mut DirectorySymbols,
) -> Result<()> {
    out.add_directory(PeSymbol::Directory {
        rva,
        size,
        name: "Load Config".to_string(),
    });

    let tables = GuardTables::read(image, rva, size, pointer_size)?;
    let stride = tables.stride();
    trace!(?tables, stride, "guard tables");

    let candidates = [
        (LoadConfigTableKind::Gfids, tables.gfids_va, tables.gfids_count),
        (LoadConfigTableKind::Giats, tables.giats_va, tables.giats_count),
    ];
    for (kind, va, count) in candidates {
        match table_symbol(kind, va, count, stride, preferred_base) {
            Some(symbol) => out.add(symbol),
            None if va != 0 && count != 0 => {
                debug!(table = kind.name(), va, count, "guard table outside the image")
            }
            None => {}
        }
    }

    Ok(())
}
