//! ARM32 and ARM64 `.pdata` / `.xdata` decoding.
//!
//! Both architectures use an 8-byte PDATA record: the function start and a
//! second word whose low two bits say how to read the rest. XDATA records
//! share a layout except for the header word, where ARM64 has one less flag
//! bit and wider counts.

use tracing::trace;

use crate::data_dir::DataDirectory;
use crate::exception::UnwindDecoder;
use crate::handler::{UnwindArch, XdataParser};
use crate::provider::SymbolProvider;
use crate::reader::ImageView;
use crate::symbol::{PdataKind, PdataSymbol, PdataTable, XdataKind};
use crate::{Error, Result};

/// ARM RUNTIME_FUNCTION (8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArmRuntimeFunction {
    pub function_start: u32,
    /// XDATA RVA or packed unwind data, tagged in the low two bits.
    pub metadata: u32,
}

impl ArmRuntimeFunction {
    pub const SIZE: u32 = 8;

    pub fn read(image: &ImageView<'_>, rva: u32) -> Result<Self> {
        Ok(Self {
            function_start: image.read_u32_at(rva)?,
            metadata: image.read_u32_at(rva.saturating_add(4))?,
        })
    }

    pub fn flag(&self) -> PdataFlag {
        match self.metadata & 0x3 {
            0 => PdataFlag::ExceptionInfo,
            1 => PdataFlag::PackedUnwindData,
            2 => PdataFlag::PackedUnwindDataNoProlog,
            _ => PdataFlag::Forwarder,
        }
    }
}

/// Meaning of the low two bits of the PDATA metadata word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdataFlag {
    ExceptionInfo,
    PackedUnwindData,
    PackedUnwindDataNoProlog,
    Forwarder,
}

/// XDATA header fields needed to size the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdataHeader {
    pub version: u8,
    /// X: an exception handler RVA follows the unwind codes.
    pub has_exception_handler: bool,
    /// E: the single epilog is packed into the header.
    pub single_epilog: bool,
    pub epilog_count: u32,
    pub code_words: u32,
    /// 4, or 8 when the extension word is present.
    pub header_size: u32,
}

impl XdataHeader {
    pub fn read(image: &ImageView<'_>, rva: u32, arm32: bool) -> Result<Self> {
        let word = image.read_u32_at(rva)?;
        let packed = if arm32 {
            (word >> 23) & 0x1ff
        } else {
            (word >> 22) & 0x3ff
        };

        let (epilog_count, code_words, header_size) = if packed != 0 {
            if arm32 {
                ((word >> 23) & 0x1f, (word >> 28) & 0xf, 4)
            } else {
                ((word >> 22) & 0x1f, (word >> 27) & 0x1f, 4)
            }
        } else {
            let extended = image.read_u32_at(rva.saturating_add(4))?;
            (extended & 0xffff, (extended >> 16) & 0xff, 8)
        };

        Ok(Self {
            version: ((word >> 18) & 0x3) as u8,
            has_exception_handler: (word >> 20) & 1 == 1,
            single_epilog: (word >> 21) & 1 == 1,
            epilog_count,
            code_words,
            header_size,
        })
    }

    /// Bytes from the header through the handler RVA, if any.
    pub fn record_size(&self) -> u32 {
        let epilogs = if self.single_epilog {
            0
        } else {
            self.epilog_count.saturating_mul(4)
        };
        let handler = if self.has_exception_handler { 4 } else { 0 };
        self.header_size
            .saturating_add(epilogs)
            .saturating_add(self.code_words.saturating_mul(4))
            .saturating_add(handler)
    }
}

/// Decoder for ARM32 (Thumb-2) and ARM64 images.
#[derive(Debug, Clone, Copy)]
pub struct ArmDecoder {
    arm32: bool,
}

impl ArmDecoder {
    pub fn new(arm32: bool) -> Self {
        Self { arm32 }
    }

    /// Code addresses on ARM32 carry the Thumb bit.
    fn code_rva(&self, rva: u32) -> u32 {
        if self.arm32 {
            rva & !1
        } else {
            rva
        }
    }
}

impl UnwindDecoder for ArmDecoder {
    fn arch(&self) -> UnwindArch {
        UnwindArch::Arm
    }

    fn parse_pdata(&self, image: &ImageView<'_>, directory: DataDirectory) -> Result<PdataTable> {
        let mut pdata = PdataTable::new();
        for index in 0..directory.size / ArmRuntimeFunction::SIZE {
            let rva = directory
                .virtual_address
                .saturating_add(index * ArmRuntimeFunction::SIZE);
            let function = ArmRuntimeFunction::read(image, rva)?;
            if function.function_start == 0 && function.metadata == 0 {
                continue;
            }

            let kind = match function.flag() {
                PdataFlag::ExceptionInfo => PdataKind::Plain {
                    unwind_info_rva: function.metadata,
                },
                PdataFlag::Forwarder => PdataKind::Forwarder,
                PdataFlag::PackedUnwindData | PdataFlag::PackedUnwindDataNoProlog => PdataKind::PackedUnwindData,
            };
            pdata.insert(
                rva,
                PdataSymbol {
                    kind,
                    rva,
                    size: ArmRuntimeFunction::SIZE,
                    target_start_rva: self.code_rva(function.function_start),
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
            // Forwarders and packed records have no XDATA.
            if let Some(xdata_rva) = record.unwind_info_rva() {
                self.parse_one_xdata(parser, record.target_start_rva, xdata_rva)?;
            }
        }
        Ok(())
    }
}

impl ArmDecoder {
    fn parse_one_xdata<P: SymbolProvider + ?Sized>(
        &self,
        parser: &mut XdataParser<'_, P>,
        function_start: u32,
        rva: u32,
    ) -> Result<()> {
        let header = XdataHeader::read(&parser.image, rva, self.arm32)?;
        if header.version != 0 {
            return Err(Error::UnsupportedXdataVersion {
                version: header.version,
                rva,
            });
        }

        let size = header.record_size();
        trace!(rva, ?header, size, "xdata");
        if !header.has_exception_handler {
            parser.add(XdataKind::UnwindInfo, function_start, rva, size);
            return Ok(());
        }

        let handler_slot = rva.saturating_add(size).saturating_sub(4);
        let handler_rva = self.code_rva(parser.image.read_u32_at(handler_slot)?);
        parser.parse_exception_handler(function_start, rva, handler_slot, handler_rva)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CodeSymbol, SourceLanguage};
    use rstest::rstest;

    struct Gs;

    impl SymbolProvider for Gs {
        fn resolve_code_symbol_at(&self, _rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
            None
        }

        fn language_of(&self, _rva: u32) -> SourceLanguage {
            SourceLanguage::Cpp
        }

        fn resolve_runtime_routine_rva(&self, name: &str) -> Option<u32> {
            (name == "__GSHandlerCheck").then_some(0x9000)
        }

        fn resolve_public_thunk_target(&self, _rva: u32) -> Option<u32> {
            None
        }
    }

    fn put(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[rstest]
    // ARM64: 2 epilogs, 3 code words.
    #[case(false, (3 << 27) | (2 << 22), 4 + 8 + 12)]
    // ARM64 with E set: epilog scopes are not stored.
    #[case(false, (3 << 27) | (2 << 22) | (1 << 21), 4 + 12)]
    // ARM32: 1 epilog, 2 code words.
    #[case(true, (2 << 28) | (1 << 23), 4 + 4 + 8)]
    fn xdata_record_size(#[case] arm32: bool, #[case] word: u32, #[case] size: u32) {
        let mut data = vec![0u8; 8];
        put(&mut data, 0, word);
        let header = XdataHeader::read(&ImageView::new(&data), 0, arm32).unwrap();
        assert_eq!(header.record_size(), size);
    }

    #[test]
    fn extended_header_word() {
        let mut data = vec![0u8; 8];
        put(&mut data, 4, (2 << 16) | 3);
        let header = XdataHeader::read(&ImageView::new(&data), 0, false).unwrap();
        assert_eq!(header.header_size, 8);
        assert_eq!(header.epilog_count, 3);
        assert_eq!(header.code_words, 2);
        assert_eq!(header.record_size(), 8 + 12 + 8);
    }

    #[test]
    fn pdata_kinds_and_thumb_bit() {
        let mut data = vec![0u8; 0x20];
        put(&mut data, 0x00, 0x1001);
        put(&mut data, 0x04, 0x2000);
        put(&mut data, 0x08, 0x1101);
        put(&mut data, 0x0C, 0x0040_0001);
        put(&mut data, 0x18, 0x1201);
        put(&mut data, 0x1C, 0x0000_0103);
        let pdata = ArmDecoder::new(true)
            .parse_pdata(&ImageView::new(&data), DataDirectory::new(0, 0x20))
            .unwrap();
        assert_eq!(pdata.len(), 3);
        assert_eq!(pdata[&0x00].kind, PdataKind::Plain { unwind_info_rva: 0x2000 });
        assert_eq!(pdata[&0x00].target_start_rva, 0x1000);
        assert_eq!(pdata[&0x08].kind, PdataKind::PackedUnwindData);
        assert_eq!(pdata[&0x18].kind, PdataKind::Forwarder);
    }

    #[test]
    fn arm64_keeps_low_bit() {
        let mut data = vec![0u8; 8];
        put(&mut data, 0, 0x1001);
        put(&mut data, 4, 0x2000);
        let pdata = ArmDecoder::new(false)
            .parse_pdata(&ImageView::new(&data), DataDirectory::new(0, 8))
            .unwrap();
        assert_eq!(pdata[&0].target_start_rva, 0x1001);
    }

    #[test]
    fn nonzero_version_is_rejected() {
        let mut data = vec![0u8; 8];
        put(&mut data, 0, (1 << 18) | (1 << 27));
        let provider = Gs;
        let mut parser = XdataParser::new(ImageView::new(&data), &provider, UnwindArch::Arm);
        let err = ArmDecoder::new(false).parse_one_xdata(&mut parser, 0x1000, 0).unwrap_err();
        assert!(matches!(err, Error::UnsupportedXdataVersion { version: 1, rva: 0 }));
    }

    #[test]
    fn handler_is_the_last_word() {
        let mut data = vec![0u8; 0x20];
        // ARM32: X set, E set, one code word.
        put(&mut data, 0, (1 << 28) | (1 << 23) | (1 << 21) | (1 << 20));
        // Handler RVA with the Thumb bit, then GS flags.
        put(&mut data, 0x08, 0x9001);
        put(&mut data, 0x0C, 0x4);
        let provider = Gs;
        let mut parser = XdataParser::new(ImageView::new(&data), &provider, UnwindArch::Arm);
        ArmDecoder::new(true).parse_one_xdata(&mut parser, 0x1000, 0).unwrap();
        // Header, one code word, handler RVA, then a GS word with no extra.
        assert_eq!(parser.xdata.get(0).unwrap().size, 4 + 4 + 4 + 4);
    }
}
