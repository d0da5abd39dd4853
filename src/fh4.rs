//! Compressed C++ EH metadata (FuncInfo4, `__CxxFrameHandler4`).
//!
//! FuncInfo4 and the tables it references are stored with a variable length
//! unsigned integer encoding. The low bits of the first byte select the
//! encoded length (1 to 5 bytes); the value occupies the remaining high bits.
//! Since none of these tables carry an explicit size, decoding is the only
//! way to learn how many bytes each one spans.

use bitflags::bitflags;
use tracing::trace;

use crate::handler::XdataParser;
use crate::provider::SymbolProvider;
use crate::reader::{ImageCursor, ImageView};
use crate::symbol::XdataKind;
use crate::Result;

bitflags! {
    /// First byte of a FuncInfo4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FuncInfoHeader: u8 {
        const IS_CATCH = 1 << 0;
        const IS_SEPARATED = 1 << 1;
        const BBT = 1 << 2;
        const UNWIND_MAP = 1 << 3;
        const TRY_BLOCK_MAP = 1 << 4;
        const EHS = 1 << 5;
        const NO_EXCEPT = 1 << 6;
    }
}

bitflags! {
    /// First byte of a HandlerMap4 entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandlerHeader: u8 {
        const ADJECTIVES = 1 << 0;
        const DISP_TYPE = 1 << 1;
        const DISP_CATCH_OBJ = 1 << 2;
        const CONT_IS_RVA = 1 << 3;
        const CONT_ADDR = 0b0011_0000;
    }
}

impl HandlerHeader {
    /// Number of continuation addresses that follow the entry.
    pub fn continuation_count(self) -> u32 {
        match (self.bits() & Self::CONT_ADDR.bits()) >> 4 {
            1 => 1,
            2 => 2,
            _ => 0,
        }
    }
}

const LENGTH_TABLE: [u8; 16] = [1, 2, 1, 3, 1, 2, 1, 4, 1, 2, 1, 3, 1, 2, 1, 5];
const SHIFT_TABLE: [u8; 16] = [25, 18, 25, 11, 25, 18, 25, 4, 25, 18, 25, 11, 25, 18, 25, 0];

/// Decode one compressed unsigned integer and advance past it.
pub fn read_unsigned(cursor: &mut ImageCursor<'_>) -> Result<u32> {
    let start = cursor.position();
    let first = cursor.image().read_u8_at(start)?;
    let length_bits = usize::from(first & 0x0F);
    let len = LENGTH_TABLE[length_bits];
    let bytes = cursor.image().bytes_at(start, usize::from(len))?;

    // The value sits in the top bits of the little-endian word that ends
    // at the last encoded byte.
    let kept = bytes.len().min(4);
    let mut word = [0u8; 4];
    word[4 - kept..].copy_from_slice(&bytes[bytes.len() - kept..]);
    let value = u32::from_le_bytes(word) >> SHIFT_TABLE[length_bits];

    cursor.skip(u32::from(len))?;
    Ok(value)
}

/// Read a raw image-relative displacement.
pub fn read_int(cursor: &mut ImageCursor<'_>) -> Result<i32> {
    cursor.read_i32()
}

fn read_disp(cursor: &mut ImageCursor<'_>) -> Result<u32> {
    Ok(read_int(cursor)? as u32)
}

/// Decoded FuncInfo4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuncInfo4 {
    pub header: FuncInfoHeader,
    pub bbt_flags: u32,
    pub unwind_map_rva: u32,
    pub try_block_map_rva: u32,
    /// IP-to-state map, or the separated segment table when
    /// [`FuncInfoHeader::IS_SEPARATED`] is set.
    pub ip_to_state_map_rva: u32,
    pub frame_displacement: u32,
    /// Encoded length of the header.
    pub size: u32,
}

impl FuncInfo4 {
    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        let mut cursor = image.cursor(rva);
        let header = FuncInfoHeader::from_bits_retain(cursor.read_u8()?);
        let mut info = Self {
            header,
            ..Self::default()
        };

        if header.contains(FuncInfoHeader::BBT) {
            info.bbt_flags = read_unsigned(&mut cursor)?;
        }
        if header.contains(FuncInfoHeader::UNWIND_MAP) {
            info.unwind_map_rva = read_disp(&mut cursor)?;
        }
        if header.contains(FuncInfoHeader::TRY_BLOCK_MAP) {
            info.try_block_map_rva = read_disp(&mut cursor)?;
        }
        info.ip_to_state_map_rva = read_disp(&mut cursor)?;
        if header.contains(FuncInfoHeader::IS_CATCH) {
            info.frame_displacement = read_unsigned(&mut cursor)?;
        }

        info.size = cursor.position().saturating_sub(rva);
        Ok(info)
    }
}

fn unwind_map_size(image: &ImageView<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image.cursor(rva);
    let entries = read_unsigned(&mut cursor)?;
    for _ in 0..entries {
        let offset_and_type = read_unsigned(&mut cursor)?;
        match offset_and_type & 0b11 {
            // Destructor of an object, or of an object through a pointer.
            0b01 | 0b10 => {
                read_int(&mut cursor)?;
                read_unsigned(&mut cursor)?;
            }
            0b11 => {
                read_int(&mut cursor)?;
            }
            _ => {}
        }
    }
    Ok(cursor.position().saturating_sub(rva))
}

/// Try block map size and the handler arrays its entries point at.
fn try_block_map(image: &ImageView<'_>, rva: u32) -> Result<(u32, Vec<u32>)> {
    let mut cursor = image.cursor(rva);
    let entries = read_unsigned(&mut cursor)?;
    let mut handler_arrays = Vec::new();
    for _ in 0..entries {
        // tryLow, tryHigh, catchHigh
        for _ in 0..3 {
            read_unsigned(&mut cursor)?;
        }
        let handler_array = read_disp(&mut cursor)?;
        if handler_array != 0 {
            handler_arrays.push(handler_array);
        }
    }
    Ok((cursor.position().saturating_sub(rva), handler_arrays))
}

fn handler_map_size(image: &ImageView<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image.cursor(rva);
    let entries = read_unsigned(&mut cursor)?;
    for _ in 0..entries {
        let header = HandlerHeader::from_bits_retain(cursor.read_u8()?);
        if header.contains(HandlerHeader::ADJECTIVES) {
            read_unsigned(&mut cursor)?;
        }
        if header.contains(HandlerHeader::DISP_TYPE) {
            read_int(&mut cursor)?;
        }
        if header.contains(HandlerHeader::DISP_CATCH_OBJ) {
            read_unsigned(&mut cursor)?;
        }
        // dispOfHandler
        read_int(&mut cursor)?;
        for _ in 0..header.continuation_count() {
            if header.contains(HandlerHeader::CONT_IS_RVA) {
                read_int(&mut cursor)?;
            } else {
                read_unsigned(&mut cursor)?;
            }
        }
    }
    Ok(cursor.position().saturating_sub(rva))
}

fn ip_to_state_map_size(image: &ImageView<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image.cursor(rva);
    let entries = read_unsigned(&mut cursor)?;
    for _ in 0..entries {
        // IP delta, then state + 1.
        read_unsigned(&mut cursor)?;
        read_unsigned(&mut cursor)?;
    }
    Ok(cursor.position().saturating_sub(rva))
}

/// One function segment of a separated (PGO split) function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeparatedSegment {
    pub start_rva: u32,
    pub ip_to_state_map_rva: u32,
}

fn separated_segments(image: &ImageView<'_>, rva: u32) -> Result<(u32, Vec<SeparatedSegment>)> {
    let mut cursor = image.cursor(rva);
    let entries = read_unsigned(&mut cursor)?;
    let mut segments = Vec::new();
    for _ in 0..entries {
        segments.push(SeparatedSegment {
            start_rva: read_disp(&mut cursor)?,
            ip_to_state_map_rva: read_disp(&mut cursor)?,
        });
    }
    Ok((cursor.position().saturating_sub(rva), segments))
}

/// Record a FuncInfo4 and every table it points at.
pub(crate) fn parse_func_info4<P: SymbolProvider + ?Sized>(
    parser: &mut XdataParser<'_, P>,
    function_start: u32,
    rva: u32,
) -> Result<()> {
    let image = parser.image;
    let info = FuncInfo4::read(&image, rva)?;
    trace!(rva, ?info, "FuncInfo4");
    parser.add(XdataKind::CppXdata, function_start, rva, info.size);

    if info.header.contains(FuncInfoHeader::UNWIND_MAP) && info.unwind_map_rva != 0 {
        let size = unwind_map_size(&image, info.unwind_map_rva)?;
        parser.add(XdataKind::StateUnwindMap, function_start, info.unwind_map_rva, size);
    }

    if info.header.contains(FuncInfoHeader::TRY_BLOCK_MAP)
        && info.try_block_map_rva != 0
        && !parser.xdata.contains(info.try_block_map_rva)
    {
        let (size, handler_arrays) = try_block_map(&image, info.try_block_map_rva)?;
        parser.add(XdataKind::TryMap, function_start, info.try_block_map_rva, size);
        for handler_array in handler_arrays {
            let size = handler_map_size(&image, handler_array)?;
            parser.add(XdataKind::HandlerMap, function_start, handler_array, size);
        }
    }

    if info.ip_to_state_map_rva == 0 {
        return Ok(());
    }

    if info.header.contains(FuncInfoHeader::IS_SEPARATED) {
        let (size, segments) = separated_segments(&image, info.ip_to_state_map_rva)?;
        parser.add(
            XdataKind::SeparatedIpToStateMap,
            function_start,
            info.ip_to_state_map_rva,
            size,
        );
        for segment in segments {
            let size = ip_to_state_map_size(&image, segment.ip_to_state_map_rva)?;
            parser.add(
                XdataKind::IpToStateMap,
                segment.start_rva,
                segment.ip_to_state_map_rva,
                size,
            );
        }
    } else {
        let size = ip_to_state_map_size(&image, info.ip_to_state_map_rva)?;
        parser.add(XdataKind::IpToStateMap, function_start, info.ip_to_state_map_rva, size);
    }

    Ok(())
}
