//! Decoder configuration and alignment helpers.

use crate::range::RvaRange;

/// Align a value up to the given alignment.
#[inline]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.saturating_add(alignment - 1) & !(alignment - 1)
}

/// Align to the 8-byte boundary used between resource data blobs.
#[inline]
pub fn align8(value: u32) -> u32 {
    align_up(value, 8)
}

/// Tunables for a decoding pass.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Gap tolerated when coalescing XDATA ranges.
    pub xdata_merge_padding: u32,
    /// Gap tolerated when coalescing delay-load thunk, string and module
    /// handle ranges.
    pub delay_load_merge_padding: u32,
    /// Gap tolerated when coalescing the ranges of all directory symbols.
    pub pe_symbol_merge_padding: u32,
    /// XDATA range known from elsewhere (for example a COFF group) that is
    /// folded into the computed XDATA ranges.
    pub known_xdata_range: Option<RvaRange>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            xdata_merge_padding: 8,
            delay_load_merge_padding: 8,
            pe_symbol_merge_padding: 16,
            known_xdata_range: None,
        }
    }
}

impl DecoderConfig {
    pub fn with_known_xdata_range(mut self, range: RvaRange) -> Self {
        self.known_xdata_range = Some(range);
        self
    }
}
