//! Interface to the debug-symbol database.
//!
//! Decoding XDATA needs a few answers only a symbol provider (typically a
//! PDB reader) can give: which function owns an address, what language it
//! was compiled from, and where the runtime's exception handler routines
//! live.

/// Source language of the compiland that owns a piece of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceLanguage {
    Unknown,
    C,
    Cpp,
    Masm,
    Rust,
    Other,
}

/// A code symbol as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSymbol {
    pub rva: u32,
    pub size: u32,
    pub name: String,
}

impl CodeSymbol {
    pub fn new(rva: u32, size: u32, name: impl Into<String>) -> Self {
        Self {
            rva,
            size,
            name: name.into(),
        }
    }

    /// True when `rva` falls inside the symbol. A zero-sized symbol covers
    /// only its own start.
    pub fn covers(&self, rva: u32) -> bool {
        let last = self.rva.saturating_add(self.size.saturating_sub(1));
        rva >= self.rva && rva <= last
    }
}

/// Lookups the decoders need from the symbol database. All calls are
/// synchronous and read-only.
pub trait SymbolProvider {
    /// The code symbol at `rva`, or the closest one preceding it when
    /// `allow_nearest` is set.
    fn resolve_code_symbol_at(&self, rva: u32, allow_nearest: bool) -> Option<CodeSymbol>;

    /// Language of the compiland containing `rva`.
    fn language_of(&self, rva: u32) -> SourceLanguage;

    /// RVA of a runtime support routine such as `__CxxFrameHandler4`.
    fn resolve_runtime_routine_rva(&self, name: &str) -> Option<u32>;

    /// When `rva` is a public thunk (for example an incremental-linking
    /// thunk), the RVA it ultimately jumps to.
    fn resolve_public_thunk_target(&self, rva: u32) -> Option<u32>;

    /// Name of whatever symbol sits exactly at `rva`, used in error text.
    fn symbol_name_at(&self, rva: u32) -> Option<String> {
        self.resolve_code_symbol_at(rva, false).map(|s| s.name)
    }
}

/// Resolve the code symbol that `rva` belongs to, discarding nearest
/// matches that do not actually cover it.
pub fn target_symbol<P: SymbolProvider + ?Sized>(provider: &P, rva: u32) -> Option<CodeSymbol> {
    provider
        .resolve_code_symbol_at(rva, true)
        .filter(|symbol| symbol.covers(rva))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Single(CodeSymbol);

    impl SymbolProvider for Single {
        fn resolve_code_symbol_at(&self, rva: u32, allow_nearest: bool) -> Option<CodeSymbol> {
            if rva == self.0.rva || (allow_nearest && rva > self.0.rva) {
                Some(self.0.clone())
            } else {
                None
            }
        }

        fn language_of(&self, _rva: u32) -> SourceLanguage {
            SourceLanguage::Cpp
        }

        fn resolve_runtime_routine_rva(&self, _name: &str) -> Option<u32> {
            None
        }

        fn resolve_public_thunk_target(&self, _rva: u32) -> Option<u32> {
            None
        }
    }

    #[test]
    fn nearest_match_must_cover() {
        let provider = Single(CodeSymbol::new(0x1000, 0x20, "f"));
        assert_eq!(target_symbol(&provider, 0x1010).map(|s| s.name), Some("f".into()));
        assert_eq!(target_symbol(&provider, 0x101F).map(|s| s.rva), Some(0x1000));
        assert!(target_symbol(&provider, 0x1020).is_none());
        assert_eq!(provider.symbol_name_at(0x1000).as_deref(), Some("f"));
        assert!(provider.symbol_name_at(0x1004).is_none());
    }

    #[test]
    fn zero_sized_symbol_covers_start() {
        let sym = CodeSymbol::new(0x2000, 0, "label");
        assert!(sym.covers(0x2000));
        assert!(!sym.covers(0x2001));
    }
}
