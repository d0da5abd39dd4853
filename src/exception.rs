//! Exception directory (PDATA) and unwind data (XDATA) decoding.
//!
//! The PDATA table is decoded in full first; the XDATA pass then walks it
//! entry by entry. Both passes are architecture specific, so they live
//! behind [`UnwindDecoder`] and the orchestration here only picks the
//! decoder for the image's machine type.

use tracing::{debug, debug_span};

use crate::amd64::Amd64Decoder;
use crate::arm::ArmDecoder;
use crate::config::DecoderConfig;
use crate::data_dir::{DataDirectory, DataDirectoryType};
use crate::handler::{UnwindArch, XdataParser};
use crate::headers::{ImageInfo, MachineType};
use crate::provider::SymbolProvider;
use crate::range::{RvaRange, RvaRangeSet};
use crate::reader::ImageView;
use crate::symbol::{PdataTable, XdataSymbol, XdataTable};
use crate::{Error, Result};

/// Architecture-specific half of exception table decoding.
pub(crate) trait UnwindDecoder {
    fn arch(&self) -> UnwindArch;

    /// Decode every record of the exception directory.
    fn parse_pdata(&self, image: &ImageView<'_>, directory: DataDirectory) -> Result<PdataTable>;

    /// Decode the unwind data referenced by `pdata` into `parser`.
    fn parse_xdata<P: SymbolProvider + ?Sized>(
        &self,
        parser: &mut XdataParser<'_, P>,
        pdata: &PdataTable,
    ) -> Result<()>;
}

/// Decoded exception tables of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionTables {
    pub pdata: PdataTable,
    pub xdata: XdataTable,
    /// Bytes of the exception directory.
    pub pdata_range: RvaRange,
    /// Coalesced ranges of every XDATA record.
    pub xdata_ranges: RvaRangeSet,
}

impl ExceptionTables {
    pub fn is_empty(&self) -> bool {
        self.pdata.is_empty() && self.xdata.is_empty()
    }
}

/// Decode the PDATA and XDATA of an image.
///
/// I386 images carry no table-based unwind data and yield empty tables, as
/// do images without an exception directory. Other machines without a
/// decoder are an error.
pub fn parse_exception_tables<P: SymbolProvider + ?Sized>(
    image: &ImageView<'_>,
    info: &ImageInfo,
    provider: &P,
    config: &DecoderConfig,
) -> Result<ExceptionTables> {
    let machine = info
        .machine_type()
        .ok_or(Error::UnsupportedMachine(info.machine))?;
    let directory = info.directory(DataDirectoryType::Exception);

    match machine {
        MachineType::I386 => Ok(ExceptionTables::default()),
        _ if !directory.is_present() => {
            debug!(?machine, "no exception directory");
            Ok(ExceptionTables::default())
        }
        MachineType::Amd64 => run(&Amd64Decoder, image, directory, provider, config),
        MachineType::Arm | MachineType::ArmNt | MachineType::Arm64 => run(
            &ArmDecoder::new(machine.is_arm32()),
            image,
            directory,
            provider,
            config,
        ),
    }
}

fn run<D: UnwindDecoder, P: SymbolProvider + ?Sized>(
    decoder: &D,
    image: &ImageView<'_>,
    directory: DataDirectory,
    provider: &P,
    config: &DecoderConfig,
) -> Result<ExceptionTables> {
    let pdata = {
        let _span = debug_span!("Parsing PDATA").entered();
        let pdata = decoder.parse_pdata(image, directory)?;
        debug!(records = pdata.len(), "PDATA parsed");
        pdata
    };

    let _span = debug_span!("Parsing XDATA").entered();
    let mut parser = XdataParser::new(*image, provider, decoder.arch());
    decoder.parse_xdata(&mut parser, &pdata)?;
    let xdata = parser.xdata;

    let xdata_ranges = RvaRangeSet::from_ranges(
        config
            .known_xdata_range
            .into_iter()
            .chain(xdata.values().map(XdataSymbol::range)),
        config.xdata_merge_padding,
    );
    debug!(records = xdata.len(), ranges = xdata_ranges.len(), "XDATA parsed");

    Ok(ExceptionTables {
        pdata,
        xdata,
        pdata_range: RvaRange::from_rva_and_size(directory.virtual_address, directory.size),
        xdata_ranges,
    })
}
