//! # pe-unwind
//!
//! A structural decoder for Windows PE images.
//!
//! Given an image laid out as it appears mapped into memory, this library
//! recovers the records that make up its data directories (imports,
//! delay-load imports, load config, debug, resources) and its exception
//! unwind metadata: the PDATA table, the XDATA unwind records, and the C++
//! EH tables they reference in both the FUNCINFO and the compressed
//! FuncInfo4 format.
//!
//! Unwind decoding needs a few facts only debug symbols can provide, such as
//! where `__CxxFrameHandler4` lives. Those come from a [`SymbolProvider`].
//!
//! ## Features
//!
//! - **x64, ARM32 and ARM64** exception tables.
//! - **Fail-fast**: every read is bounds checked, and malformed or
//!   unsupported records are reported as [`Error`]s instead of guessed at.
//! - **Read-only results**: every decoder returns plain owned maps keyed by
//!   RVA, plus coalesced [`RvaRangeSet`]s describing what the records cover.
//!
//! ## Example
//!
//! ```no_run
//! use pe_unwind::{
//!     parse_exception_tables, read_directories, walk_resources, CodeSymbol, DecoderConfig,
//!     ImageInfo, ImageView, SourceLanguage, SymbolProvider,
//! };
//!
//! struct NoPdb;
//!
//! impl SymbolProvider for NoPdb {
//!     fn resolve_code_symbol_at(&self, _rva: u32, _allow_nearest: bool) -> Option<CodeSymbol> {
//!         None
//!     }
//!     fn language_of(&self, _rva: u32) -> SourceLanguage {
//!         SourceLanguage::Unknown
//!     }
//!     fn resolve_runtime_routine_rva(&self, _name: &str) -> Option<u32> {
//!         None
//!     }
//!     fn resolve_public_thunk_target(&self, _rva: u32) -> Option<u32> {
//!         None
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mapped: Vec<u8> = std::fs::read("example.mapped")?;
//! let image = ImageView::new(&mapped);
//! let info = ImageInfo::from_headers(&image)?;
//! let config = DecoderConfig::default();
//!
//! let directories = read_directories(&image, &info, &config)?;
//! let resources = walk_resources(&image, &info)?;
//! let tables = parse_exception_tables(&image, &info, &NoPdb, &config)?;
//! println!(
//!     "{} directory symbols, {} resources, {} pdata records",
//!     directories.symbols.len(),
//!     resources.len(),
//!     tables.pdata.len()
//! );
//! # Ok(())
//! # }
//! ```

pub mod amd64;
pub mod arm;
pub mod config;
pub mod cxx;
pub mod data_dir;
pub mod debug;
pub mod delay_import;
pub mod directory;
pub mod error;
pub mod exception;
pub mod fh4;
pub mod handler;
pub mod headers;
pub mod import;
pub mod loadconfig;
pub mod provider;
pub mod range;
pub mod reader;
pub mod resource;
pub mod symbol;

pub use config::DecoderConfig;
pub use data_dir::{DataDirectory, DataDirectoryType};
pub use debug::{DebugSignature, DebugType};
pub use delay_import::DelayLoadRanges;
pub use directory::{read_directories, DirectorySymbols};
pub use error::{Error, Result};
pub use exception::{parse_exception_tables, ExceptionTables};
pub use headers::{ImageInfo, MachineType};
pub use provider::{CodeSymbol, SourceLanguage, SymbolProvider};
pub use range::{RvaRange, RvaRangeSet};
pub use reader::ImageView;
pub use resource::{walk_resources, ResourceSymbols};
pub use symbol::{
    PdataKind, PdataSymbol, PdataTable, PeSymbol, RsrcSymbol, XdataKind, XdataSymbol, XdataTable,
};
