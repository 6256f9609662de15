//! # Session Configuration
//!
//! Symbol search path, symbol-loading options and the dbghelp session handle
//! a [`KernelSession`](crate::session::KernelSession) applies at construction.
//!
//! ## Environment Variables
//!
//! - `_NT_SYMBOL_PATH`: symbol search path (the engine's own variable)
//! - `LKD_SYMBOL_CACHE`: local cache directory of the default symbol server
//!   path (default: `./symbols`)
//! - `LKD_SYMBOL_OPTIONS`: `SYMOPT_*` mask, hex (`0x30237`) or decimal

use std::env;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use tracing::warn;

/// Public Microsoft symbol server
pub const MICROSOFT_SYMBOL_SERVER: &str = "https://msdl.microsoft.com/download/symbols";

/// Process handle the engine registers its dbghelp session under
pub const DBGENG_TYPE_INFO_HANDLE: u64 = 0xF0F0_F0F0;

/// `SRV*<cache>*<server>`, computed once per process.
static DEFAULT_SYMBOL_PATH: Lazy<String> = Lazy::new(|| {
    let cache = env::var("LKD_SYMBOL_CACHE").unwrap_or_else(|_| "./symbols".to_string());
    format!("SRV*{cache}*{MICROSOFT_SYMBOL_SERVER}")
});

bitflags! {
    /// Symbol-loading options (`SYMOPT_*`)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SymbolOptions: u32 {
        const CASE_INSENSITIVE = 0x0000_0001;
        const UNDNAME = 0x0000_0002;
        const DEFERRED_LOADS = 0x0000_0004;
        const LOAD_LINES = 0x0000_0010;
        const OMAP_FIND_NEAREST = 0x0000_0020;
        const NO_UNQUALIFIED_LOADS = 0x0000_0100;
        const FAIL_CRITICAL_ERRORS = 0x0000_0200;
        const AUTO_PUBLICS = 0x0001_0000;
        const NO_IMAGE_SEARCH = 0x0002_0000;
    }
}

impl Default for SymbolOptions
{
    fn default() -> Self
    {
        SymbolOptions::NO_IMAGE_SEARCH
            | SymbolOptions::AUTO_PUBLICS
            | SymbolOptions::FAIL_CRITICAL_ERRORS
            | SymbolOptions::OMAP_FIND_NEAREST
            | SymbolOptions::LOAD_LINES
            | SymbolOptions::DEFERRED_LOADS
            | SymbolOptions::UNDNAME
            | SymbolOptions::CASE_INSENSITIVE
    }
}

impl SymbolOptions
{
    /// Parse a `0x`-hex or decimal mask. Unknown bits are kept.
    pub fn parse_mask(input: &str) -> Option<Self>
    {
        let input = input.trim();
        let bits = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => input.parse::<u32>().ok()?,
        };
        Some(SymbolOptions::from_bits_retain(bits))
    }
}

/// Configuration applied to the engine when a session is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Symbol search path handed to `SetSymbolPath`
    pub symbol_path: String,
    /// Options handed to `SetSymbolOptions`
    pub symbol_options: SymbolOptions,
    /// dbghelp process handle used by the low-level type-info query
    pub type_info_handle: u64,
    /// Suppress engine output on stdout
    pub quiet: bool,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            symbol_path: DEFAULT_SYMBOL_PATH.clone(),
            symbol_options: SymbolOptions::default(),
            type_info_handle: DBGENG_TYPE_INFO_HANDLE,
            quiet: false,
        }
    }
}

impl SessionConfig
{
    /// Build the configuration from the environment.
    ///
    /// An unparsable `LKD_SYMBOL_OPTIONS` is ignored with a warning.
    pub fn from_env() -> Self
    {
        let mut config = Self::default();
        if let Ok(path) = env::var("_NT_SYMBOL_PATH") {
            if !path.trim().is_empty() {
                config.symbol_path = path;
            }
        }
        if let Ok(raw) = env::var("LKD_SYMBOL_OPTIONS") {
            match SymbolOptions::parse_mask(&raw) {
                Some(options) => config.symbol_options = options,
                None => warn!("Ignoring LKD_SYMBOL_OPTIONS={:?}: not a hex or decimal mask", raw),
            }
        }
        config
    }

    #[must_use]
    pub fn with_symbol_path(mut self, path: impl Into<String>) -> Self
    {
        self.symbol_path = path.into();
        self
    }

    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self
    {
        self.quiet = quiet;
        self
    }
}
