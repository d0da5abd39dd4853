//! Exception handler classification and language-specific data sizing.
//!
//! An UNWIND_INFO that names an exception handler is followed by the
//! handler's RVA and then by data whose layout only that handler knows.
//! The runtime routines the decoder understands are resolved once through
//! the [`SymbolProvider`], then every handler RVA is matched against them.

use std::collections::BTreeMap;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::cxx::{parse_func_info, EH_MAGIC_NUMBER3};
use crate::fh4::parse_func_info4;
use crate::provider::{SourceLanguage, SymbolProvider};
use crate::reader::ImageView;
use crate::symbol::{XdataKind, XdataSymbol, XdataTable};
use crate::{Error, Result};

bitflags! {
    /// Flags word of the GS cookie data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GsFlags: u32 {
        /// Two extra DWORDs describe the aligned frame.
        const UNW_GSALIGNEDFRAME = 0x4;
    }
}

/// Size of a C scope table record.
pub const SCOPE_RECORD_SIZE: u32 = 16;

/// Architecture family of the unwind data being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindArch {
    X64,
    Arm,
}

impl UnwindArch {
    /// Bytes the GS data carries beyond its flags word.
    pub fn gs_extra_size(self, flags: GsFlags) -> u32 {
        match self {
            Self::X64 if flags.contains(GsFlags::UNW_GSALIGNEDFRAME) => 8,
            Self::X64 | Self::Arm => 0,
        }
    }
}

/// Runtime routines with a known language-specific data layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    GsHandlerCheck,
    GsHandlerCheckEh,
    GsHandlerCheckEh4,
    GsHandlerCheckSeh,
    CxxFrameHandler,
    CxxFrameHandler4,
    CSpecificHandler,
    /// Handlers that are followed by no language-specific data at all.
    NoLanguageData,
}

const ROUTINES: &[(&str, HandlerKind)] = &[
    ("__GSHandlerCheck", HandlerKind::GsHandlerCheck),
    ("__GSHandlerCheck_EH", HandlerKind::GsHandlerCheckEh),
    ("__GSHandlerCheck_EH4", HandlerKind::GsHandlerCheckEh4),
    ("__GSHandlerCheck_SEH", HandlerKind::GsHandlerCheckSeh),
    ("__GSHandlerCheck_SEH_noexcept", HandlerKind::GsHandlerCheckSeh),
    ("__CxxFrameHandler3", HandlerKind::CxxFrameHandler),
    ("__CxxFrameHandler4", HandlerKind::CxxFrameHandler4),
    ("__C_specific_handler", HandlerKind::CSpecificHandler),
    ("__C_specific_handler_noexcept", HandlerKind::CSpecificHandler),
];

/// Older frame handlers only ever seen in x64 images.
const X64_ROUTINES: &[(&str, HandlerKind)] = &[
    ("__CxxFrameHandler", HandlerKind::CxxFrameHandler),
    ("__CxxFrameHandler2", HandlerKind::CxxFrameHandler),
];

const NO_LANGUAGE_DATA_ROUTINES: &[&str] = &[
    "RtlpExceptionHandler",
    "RtlpEmUnwindHandler",
    "KiSystemServiceHandler",
    "KiUserApcHandler",
    "KiEmulateFloatExceptHandler",
    "UMThunkUnwindFrameChainHandler",
    "KiInterruptHandler",
    "KiSwitchKernelStackAndCalloutHandler",
    "RtlpUnwindHandler",
    "ProcessCLRException",
    "FixRedirectContextHandler",
    "HijackHandler",
    "FixContextHandler",
    "KiFatalExceptionHandler",
    "_guard_icall_handler",
    "KiCustomAccessHandler0",
    "KiCustomAccessHandler1",
    "KiCustomAccessHandler2",
    "KiCustomAccessHandler3",
    "KiCustomAccessHandler4",
    "KiCustomAccessHandler5",
    "KiCustomAccessHandler6",
    "KiCustomAccessHandler7",
    "KiCustomAccessHandler8",
    "KiCustomAccessHandler9",
    "KiFilterFiberContext",
];

/// Handler RVAs of the routines the provider could locate.
#[derive(Debug, Clone, Default)]
pub struct KnownHandlers {
    by_rva: BTreeMap<u32, HandlerKind>,
}

impl KnownHandlers {
    pub fn resolve<P: SymbolProvider + ?Sized>(provider: &P, arch: UnwindArch) -> Self {
        let x64_only: &[(&str, HandlerKind)] = match arch {
            UnwindArch::X64 => X64_ROUTINES,
            UnwindArch::Arm => &[],
        };
        let routines = ROUTINES
            .iter()
            .chain(x64_only)
            .copied()
            .chain(NO_LANGUAGE_DATA_ROUTINES.iter().map(|name| (*name, HandlerKind::NoLanguageData)));

        let mut known = Self::default();
        for (name, kind) in routines {
            if let Some(rva) = provider.resolve_runtime_routine_rva(name) {
                trace!(name, rva, "resolved exception handler routine");
                known.by_rva.entry(rva).or_insert(kind);
            }
        }
        known
    }

    pub fn classify(&self, handler_rva: u32) -> Option<HandlerKind> {
        self.by_rva.get(&handler_rva).copied()
    }

    pub fn len(&self) -> usize {
        self.by_rva.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rva.is_empty()
    }
}

/// Shared state of an XDATA pass.
pub(crate) struct XdataParser<'a, P: SymbolProvider + ?Sized> {
    pub image: ImageView<'a>,
    pub provider: &'a P,
    pub arch: UnwindArch,
    pub handlers: KnownHandlers,
    pub xdata: XdataTable,
}

impl<'a, P: SymbolProvider + ?Sized> XdataParser<'a, P> {
    pub fn new(image: ImageView<'a>, provider: &'a P, arch: UnwindArch) -> Self {
        let handlers = KnownHandlers::resolve(provider, arch);
        debug!(handlers = handlers.len(), ?arch, "exception handler routines resolved");
        Self {
            image,
            provider,
            arch,
            handlers,
            xdata: XdataTable::new(),
        }
    }

    pub fn add(&mut self, kind: XdataKind, function_start: u32, rva: u32, size: u32) -> bool {
        self.xdata.insert(XdataSymbol::new(kind, function_start, rva, size))
    }

    /// Size up the data following a handler RVA and record the enclosing
    /// UNWIND_INFO.
    ///
    /// `handler_slot` is the RVA holding `handler_rva`; the language-specific
    /// data starts right after it.
    pub fn parse_exception_handler(
        &mut self,
        function_start: u32,
        unwind_info_rva: u32,
        handler_slot: u32,
        handler_rva: u32,
    ) -> Result<()> {
        let mut handler_rva = handler_rva;
        let mut retried = false;
        let kind = loop {
            if let Some(kind) = self.handlers.classify(handler_rva) {
                break kind;
            }

            match self.provider.language_of(function_start) {
                SourceLanguage::Masm | SourceLanguage::Unknown => {
                    debug!(function_start, handler_rva, "skipping unrecognized handler");
                    return Ok(());
                }
                _ => {}
            }

            // Incremental linking routes handlers through a public thunk.
            match self.provider.resolve_public_thunk_target(handler_rva) {
                Some(target) if !retried => {
                    trace!(handler_rva, target, "following handler thunk");
                    handler_rva = target;
                    retried = true;
                }
                _ => {
                    return Err(Error::UnknownExceptionHandler {
                        handler_rva,
                        handler_name: self.provider.symbol_name_at(handler_rva).unwrap_or_default(),
                        function_rva: function_start,
                        function_name: self.provider.symbol_name_at(function_start).unwrap_or_default(),
                    });
                }
            }
        };

        let lsd = handler_slot.saturating_add(4);
        let lsd_size = match kind {
            HandlerKind::GsHandlerCheckEh | HandlerKind::CxxFrameHandler => {
                let func_info_rva = self.image.read_u32_at(lsd)?;
                let magic = self.image.read_u32_at(func_info_rva)?;
                if magic != EH_MAGIC_NUMBER3 {
                    return Err(Error::UnknownCxxMagic {
                        magic,
                        rva: func_info_rva,
                    });
                }
                if !self.xdata.contains(func_info_rva) {
                    parse_func_info(self, function_start, func_info_rva)?;
                }
                4
            }
            HandlerKind::GsHandlerCheckEh4 | HandlerKind::CxxFrameHandler4 => {
                let func_info_rva = self.image.read_u32_at(lsd)?;
                if !self.xdata.contains(func_info_rva) {
                    parse_func_info4(self, function_start, func_info_rva)?;
                }
                4
            }
            HandlerKind::CSpecificHandler | HandlerKind::GsHandlerCheckSeh => self.scope_table_size(lsd)?,
            HandlerKind::GsHandlerCheck | HandlerKind::NoLanguageData => 0,
        };

        let gs_flags_rva = match kind {
            HandlerKind::GsHandlerCheckEh | HandlerKind::GsHandlerCheckEh4 => Some(lsd.saturating_add(4)),
            HandlerKind::GsHandlerCheckSeh => Some(lsd.saturating_add(lsd_size)),
            HandlerKind::GsHandlerCheck => Some(lsd),
            _ => None,
        };
        let gs_size = match gs_flags_rva {
            Some(rva) => {
                let flags = GsFlags::from_bits_retain(self.image.read_u32_at(rva)?);
                4 + self.arch.gs_extra_size(flags)
            }
            None => 0,
        };

        let size = lsd
            .saturating_sub(unwind_info_rva)
            .saturating_add(lsd_size)
            .saturating_add(gs_size);
        trace!(unwind_info_rva, ?kind, size, "unwind info with handler");
        self.add(XdataKind::UnwindInfo, function_start, unwind_info_rva, size);
        Ok(())
    }

    /// A u32 record count followed by that many scope records.
    fn scope_table_size(&self, lsd: u32) -> Result<u32> {
        let count = self.image.read_u32_at(lsd)?;
        Ok(count.saturating_mul(SCOPE_RECORD_SIZE).saturating_add(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CodeSymbol;

    struct Routines {
        language: SourceLanguage,
        thunk: Option<(u32, u32)>,
    }

    impl SymbolProvider for Routines {
        fn resolve_code_symbol_at(&self, rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
            (rva == 0x1000).then(|| CodeSymbol::new(0x1000, 0x80, "Work"))
        }

        fn language_of(&self, _rva: u32) -> SourceLanguage {
            self.language
        }

        fn resolve_runtime_routine_rva(&self, name: &str) -> Option<u32> {
            match name {
                "__GSHandlerCheck" => Some(0x9000),
                "__C_specific_handler" => Some(0x9100),
                "__GSHandlerCheck_SEH" => Some(0x9200),
                "__CxxFrameHandler" => Some(0x9300),
                "KiUserApcHandler" => Some(0x9400),
                _ => None,
            }
        }

        fn resolve_public_thunk_target(&self, rva: u32) -> Option<u32> {
            self.thunk.filter(|(from, _)| *from == rva).map(|(_, to)| to)
        }
    }

    fn provider(language: SourceLanguage) -> Routines {
        Routines { language, thunk: None }
    }

    fn image_with(writes: &[(usize, u32)]) -> Vec<u8> {
        let mut data = vec![0u8; 0x400];
        for &(offset, value) in writes {
            data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        data
    }

    #[test]
    fn x64_only_handlers() {
        let p = provider(SourceLanguage::Cpp);
        let x64 = KnownHandlers::resolve(&p, UnwindArch::X64);
        let arm = KnownHandlers::resolve(&p, UnwindArch::Arm);
        assert_eq!(x64.classify(0x9300), Some(HandlerKind::CxxFrameHandler));
        assert_eq!(arm.classify(0x9300), None);
        assert_eq!(arm.classify(0x9400), Some(HandlerKind::NoLanguageData));
        assert_eq!(x64.len(), 5);
    }

    #[test]
    fn gs_extra_depends_on_arch() {
        assert_eq!(UnwindArch::X64.gs_extra_size(GsFlags::UNW_GSALIGNEDFRAME), 8);
        assert_eq!(UnwindArch::X64.gs_extra_size(GsFlags::empty()), 0);
        assert_eq!(UnwindArch::Arm.gs_extra_size(GsFlags::UNW_GSALIGNEDFRAME), 0);
    }

    #[test]
    fn c_scope_table_size() {
        // Handler slot at 0x108, scope count 3 at 0x10C.
        let data = image_with(&[(0x10C, 3)]);
        let p = provider(SourceLanguage::C);
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
        parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x9100).unwrap();
        let unwind = parser.xdata.get(0x100).unwrap();
        assert_eq!(unwind.size, 0x0C + 4 + 3 * 16);
    }

    #[test]
    fn gs_cookie_after_seh_scope_table() {
        // One scope record, then GS flags with the aligned-frame bit.
        let data = image_with(&[(0x10C, 1), (0x10C + 20, 0x4)]);
        let p = provider(SourceLanguage::C);
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
        parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x9200).unwrap();
        assert_eq!(parser.xdata.get(0x100).unwrap().size, 0x0C + 20 + 4 + 8);
    }

    #[test]
    fn plain_gs_check() {
        let data = image_with(&[(0x10C, 0)]);
        let p = provider(SourceLanguage::Cpp);
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::Arm);
        parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x9000).unwrap();
        assert_eq!(parser.xdata.get(0x100).unwrap().size, 0x0C + 4);
    }

    #[test]
    fn unknown_handler_in_unknown_language_is_skipped() {
        let data = image_with(&[]);
        for language in [SourceLanguage::Unknown, SourceLanguage::Masm] {
            let p = provider(language);
            let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
            parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x7777).unwrap();
            assert!(parser.xdata.is_empty());
        }
    }

    #[test]
    fn unknown_handler_in_cpp_is_fatal() {
        let data = image_with(&[]);
        let p = provider(SourceLanguage::Cpp);
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
        let err = parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x7777).unwrap_err();
        match err {
            Error::UnknownExceptionHandler {
                handler_rva,
                function_rva,
                function_name,
                ..
            } => {
                assert_eq!(handler_rva, 0x7777);
                assert_eq!(function_rva, 0x1000);
                assert_eq!(function_name, "Work");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn thunked_handler_is_followed_once() {
        let data = image_with(&[(0x10C, 2)]);
        let p = Routines {
            language: SourceLanguage::Cpp,
            thunk: Some((0x7000, 0x9100)),
        };
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
        parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x7000).unwrap();
        assert_eq!(parser.xdata.get(0x100).unwrap().size, 0x0C + 4 + 32);
    }

    #[test]
    fn bad_func_info_magic() {
        let data = image_with(&[(0x10C, 0x200), (0x200, 0x1993_0521)]);
        let p = provider(SourceLanguage::Cpp);
        let mut parser = XdataParser::new(ImageView::new(&data), &p, UnwindArch::X64);
        let err = parser.parse_exception_handler(0x1000, 0x100, 0x108, 0x9300).unwrap_err();
        assert!(matches!(err, Error::UnknownCxxMagic { magic: 0x1993_0521, rva: 0x200 }));
    }
}
