//! Error types for image decoding.

use thiserror::Error;

/// Result type alias for decoder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort decoding of an image.
///
/// Everything here is fail-fast: a record that can be skipped without
/// affecting size accounting never produces an error.
#[derive(Debug, Error)]
pub enum Error {
    /// A read touched bytes outside the mapped image.
    #[error("Offset {offset:#x} (+{len} bytes) out of bounds (image size: {size:#x})")]
    OffsetOutOfBounds { offset: u64, len: usize, size: usize },

    /// Buffer too small to contain the expected structure.
    #[error("Buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    /// Invalid DOS signature (expected "MZ").
    #[error("Invalid DOS signature (expected 'MZ')")]
    InvalidDosSignature,

    /// Invalid PE signature (expected "PE\0\0").
    #[error("Invalid PE signature (expected 'PE\\0\\0')")]
    InvalidPeSignature,

    /// Invalid optional header magic.
    #[error("Invalid optional header magic: {0:#06x}")]
    InvalidOptionalHeaderMagic(u16),

    /// Machine type with no exception table decoder.
    #[error("Unknown machine type to parse exception data for: {0:#06x}")]
    UnsupportedMachine(u16),

    /// UNWIND_INFO version other than 1 or 2.
    #[error("Only version 1 and 2 UNWIND_INFO structures are supported, found version {version} at RVA {rva:#x}")]
    UnsupportedUnwindVersion { version: u8, rva: u32 },

    /// x64 PDATA entry whose unwind RVA has the low bit set.
    #[error("Chained PDATA records are not supported (PDATA entry at RVA {0:#x})")]
    ChainedPdata(u32),

    /// ARM/ARM64 XDATA header with a non-zero version.
    #[error("Only version 0 of the ARM exception data structure is supported, found version {version} at RVA {rva:#x}")]
    UnsupportedXdataVersion { version: u8, rva: u32 },

    /// An exception handler routine the decoder cannot classify.
    #[error(
        "New xdata handler type found, no parser available yet.\n\
         Exception Handler: {handler_name} (RVA:{handler_rva:#X})\n\
         Function with that handler: {function_name} (RVA:{function_rva:#X})"
    )]
    UnknownExceptionHandler {
        handler_rva: u32,
        handler_name: String,
        function_rva: u32,
        function_name: String,
    },

    /// FUNCINFO header with a magic number other than `EH_MAGIC_NUMBER3`.
    #[error("Unrecognized C++ EH magic number {magic:#010x} at RVA {rva:#x}")]
    UnknownCxxMagic { magic: u32, rva: u32 },
}

impl Error {
    pub(crate) fn out_of_bounds(offset: u64, len: usize, size: usize) -> Self {
        Error::OffsetOutOfBounds { offset, len, size }
    }

    pub(crate) fn buffer_too_small(expected: usize, actual: usize) -> Self {
        Error::BufferTooSmall { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_out_of_bounds() {
        let err = Error::out_of_bounds(0x2000, 4, 0x1000);
        assert_eq!(
            err.to_string(),
            "Offset 0x2000 (+4 bytes) out of bounds (image size: 0x1000)"
        );
    }

    #[test]
    fn displays_unknown_handler() {
        let err = Error::UnknownExceptionHandler {
            handler_rva: 0x1234,
            handler_name: "MyHandler".into(),
            function_rva: 0x1000,
            function_name: "main".into(),
        };
        let text = err.to_string();
        assert!(text.contains("MyHandler (RVA:0x1234)"));
        assert!(text.contains("main (RVA:0x1000)"));
    }
}
