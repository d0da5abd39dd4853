//! x64 RUNTIME_FUNCTION and UNWIND_INFO decoding.

use bitflags::bitflags;
use tracing::trace;

use crate::data_dir::DataDirectory;
use crate::exception::UnwindDecoder;
use crate::handler::{UnwindArch, XdataParser};
use crate::provider::SymbolProvider;
use crate::reader::ImageView;
use crate::symbol::{PdataKind, PdataSymbol, PdataTable, XdataKind};
use crate::{Error, Result};

/// RUNTIME_FUNCTION entry for x64 (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeFunction {
    /// RVA of the start of the function.
    pub begin_address: u32,
    /// RVA of the end of the function.
    pub end_address: u32,
    /// RVA of the unwind information.
    pub unwind_info_address: u32,
}

impl RuntimeFunction {
    pub const SIZE: u32 = 12;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        let mut cursor = image.cursor(rva);
        Ok(Self {
            begin_address: cursor.read_u32()?,
            end_address: cursor.read_u32()?,
            unwind_info_address: cursor.read_u32()?,
        })
    }

    /// Padding records emitted by some linkers.
    pub fn is_empty(&self) -> bool {
        self.begin_address == 0 && self.end_address == 0 && self.unwind_info_address == 0
    }
}

bitflags! {
    /// UNWIND_INFO flags (the high 5 bits of the first byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindFlags: u8 {
        const EHANDLER = 0x1;
        const UHANDLER = 0x2;
        const CHAININFO = 0x4;
    }
}

/// Fixed part of an UNWIND_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindInfoHeader {
    /// Version (3 bits) and flags (5 bits).
    pub version_flags: u8,
    pub size_of_prolog: u8,
    pub count_of_codes: u8,
    /// Frame register (4 bits) and frame register offset (4 bits).
    pub frame_reg_and_offset: u8,
}

impl UnwindInfoHeader {
    pub const SIZE: u32 = 4;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        let bytes = image.bytes_at(rva, Self::SIZE as usize)?;
        Ok(Self {
            version_flags: bytes[0],
            size_of_prolog: bytes[1],
            count_of_codes: bytes[2],
            frame_reg_and_offset: bytes[3],
        })
    }

    pub fn version(&self) -> u8 {
        self.version_flags & 0x07
    }

    pub fn raw_flags(&self) -> u8 {
        self.version_flags >> 3
    }

    pub fn flags(&self) -> UnwindFlags {
        UnwindFlags::from_bits_retain(self.raw_flags())
    }

    /// Offset of the first byte after the unwind code array, which is
    /// padded to an even number of 2-byte codes.
    pub fn codes_end(&self) -> u32 {
        let count = u32::from(self.count_of_codes);
        Self::SIZE + 2 * (count + (count & 1))
    }
}

/// Decoder for x64 images.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amd64Decoder;

impl UnwindDecoder for Amd64Decoder {
    fn arch(&self) -> UnwindArch {
        UnwindArch::X64
    }

    fn parse_pdata(&self, image: &ImageView<'_>, directory: DataDirectory) -> Result<PdataTable> {
        let mut pdata = PdataTable::new();
        for index in 0..directory.size / RuntimeFunction::SIZE {
            let rva = directory
                .virtual_address
                .saturating_add(index * RuntimeFunction::SIZE);
            let function = RuntimeFunction::read(image, rva)?;

            if function.unwind_info_address & 1 != 0 {
                return Err(Error::ChainedPdata(rva));
            }
            if function.is_empty() {
                continue;
            }

            pdata.insert(
                rva,
                PdataSymbol {
                    kind: PdataKind::Plain {
                        unwind_info_rva: function.unwind_info_address,
                    },
                    rva,
                    size: RuntimeFunction::SIZE,
                    target_start_rva: function.begin_address,
                },
            );
        }
        Ok(pdata)
    }

    fn parse_xdata<P: SymbolProvider + ?Sized>(
        &self,
        parser: &mut XdataParser<'_, P>,
        pdata: &PdataTable,
    ) -> Result<()> {
        for record in pdata.values() {
            if let Some(unwind_info_rva) = record.unwind_info_rva() {
                parse_unwind_info(parser, record.target_start_rva, unwind_info_rva)?;
            }
        }
        Ok(())
    }
}

/// Record the UNWIND_INFO at `rva` and everything it chains to.
fn parse_unwind_info<P: SymbolProvider + ?Sized>(
    parser: &mut XdataParser<'_, P>,
    function_start: u32,
    rva: u32,
) -> Result<()> {
    let mut function_start = function_start;
    let mut rva = rva;

    loop {
        let header = UnwindInfoHeader::read(&parser.image, rva)?;
        let version = header.version();
        if version == 0 && header.raw_flags() == 0 {
            trace!(rva, "skipping empty unwind info");
            return Ok(());
        }
        if !(1..=2).contains(&version) {
            return Err(Error::UnsupportedUnwindVersion { version, rva });
        }

        let after_codes = rva.saturating_add(header.codes_end());
        let flags = header.flags();

        if flags.contains(UnwindFlags::CHAININFO) {
            let size = header.codes_end() + RuntimeFunction::SIZE;
            if !parser.add(XdataKind::ChainUnwindInfo, function_start, rva, size) {
                // Already walked from another PDATA record.
                return Ok(());
            }
            let parent = RuntimeFunction::read(&parser.image, after_codes)?;
            trace!(rva, parent = ?parent, "chained unwind info");
            function_start = parent.begin_address;
            rva = parent.unwind_info_address;
            continue;
        }

        if header.raw_flags() == 0 {
            parser.add(XdataKind::UnwindInfo, function_start, rva, header.codes_end());
            return Ok(());
        }

        let handler_rva = parser.image.read_u32_at(after_codes)?;
        return parser.parse_exception_handler(function_start, rva, after_codes, handler_rva);
    }
}
