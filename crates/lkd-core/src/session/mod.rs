//! # Kernel Session
//!
//! The flat procedural API over one attached debugging engine.
//!
//! A [`KernelSession`] owns exactly one engine and exactly one bitness
//! strategy for its whole lifetime. Every operation accepts target addresses
//! (or symbol names), expands them through the strategy right before the
//! engine call and trims engine addresses right after it.
//!
//! The API is split by concern:
//!
//! - `resolve`: symbol and type resolution
//! - `memory`: virtual, physical, I/O, bus and MSR access
//! - `introspect`: type layout queries (experimental)
//! - `search`: wildcard symbol search
//! - `modules`: module enumeration and symbol reloads
//! - `commands`: command execution and disassembly
//!
//! ## Thread Safety
//!
//! The session is **not** thread-safe. The engine session is not documented
//! as safe for concurrent use, so every call is a blocking round trip from a
//! single owner. Operations that change target or session state take
//! `&mut self`.
//!
//! ## Example
//!
//! ```rust
//! use lkd_core::config::SessionConfig;
//! use lkd_core::engine::FixtureEngine;
//! use lkd_core::session::KernelSession;
//!
//! let engine = FixtureEngine::new_32bit().with_symbol("nt!KiServiceTable", 0xffff_ffff_8050_0000);
//! let session = KernelSession::detect(engine, SessionConfig::default())?;
//! assert_eq!(session.get_symbol_offset("nt!KiServiceTable").map(|a| a.value()), Some(0x8050_0000));
//! # Ok::<(), lkd_core::error::LkdError>(())
//! ```

mod commands;
mod introspect;
mod memory;
mod modules;
mod resolve;
mod search;

use std::sync::Arc;

use tracing::{debug, trace, warn};

pub use introspect::{FieldNames, TypeHandle};
pub use commands::SHELL_PROMPT;
pub use memory::WideText;
pub use search::SymbolMatches;

use crate::bitness::{Bitness, PointerWidth};
use crate::config::SessionConfig;
use crate::engine::DebugEngine;
use crate::error::{EngineResultExt, Result};
use crate::output::{OutputCallbacks, StandardOutput};
use crate::types::{Address, CanonicalAddress};

/// Size of every name buffer handed to the engine
pub(crate) const NAME_BUFFER_SIZE: usize = 1024;

/// A debugging session bound to one engine and one pointer width
pub struct KernelSession<E: DebugEngine>
{
    engine: E,
    width: PointerWidth,
    bitness: &'static dyn Bitness,
    config: SessionConfig,
    /// Callbacks the engine currently holds; kept alive until replaced
    output: Arc<dyn OutputCallbacks>,
}

impl<E: DebugEngine> std::fmt::Debug for KernelSession<E>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("KernelSession")
            .field("width", &self.width)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: DebugEngine> KernelSession<E>
{
    /// Create a session for a target of known pointer width.
    ///
    /// Applies the configured symbol path and options, then registers the
    /// standard output callbacks.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the engine rejected the symbol path, the symbol
    ///   options or the output callbacks
    pub fn new(engine: E, width: PointerWidth, config: SessionConfig) -> Result<Self>
    {
        engine.set_symbol_path(&config.symbol_path).op("set_symbol_path")?;
        engine
            .set_symbol_options(config.symbol_options.bits())
            .op("set_symbol_options")?;

        let output: Arc<dyn OutputCallbacks> = Arc::new(StandardOutput::new(config.quiet));
        engine
            .set_output_callbacks(Arc::clone(&output))
            .op("set_output_callbacks")?;

        debug!(
            "Session ready: {} target, symbol path {:?}, options 0x{:x}",
            width,
            config.symbol_path,
            config.symbol_options.bits()
        );

        Ok(Self {
            engine,
            width,
            bitness: width.strategy(),
            config,
            output,
        })
    }

    /// Create a session, asking the engine for the target's pointer width.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the width query or the engine setup failed
    pub fn detect(engine: E, config: SessionConfig) -> Result<Self>
    {
        let width = if engine.is_pointer_64bit().op("is_pointer_64bit")? {
            PointerWidth::Bits64
        } else {
            PointerWidth::Bits32
        };
        Self::new(engine, width, config)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &E
    {
        &self.engine
    }

    /// Consume the session and hand the engine back.
    pub fn into_engine(self) -> E
    {
        self.engine
    }

    pub fn width(&self) -> PointerWidth
    {
        self.width
    }

    pub fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    /// The bitness strategy bound to this session.
    pub fn bitness(&self) -> &'static dyn Bitness
    {
        self.bitness
    }

    /// Target address to engine address.
    pub fn expand(&self, addr: Address) -> CanonicalAddress
    {
        self.bitness.expand(addr)
    }

    /// Engine address to target address.
    pub fn trim(&self, raw: u64) -> Address
    {
        self.bitness.trim(raw)
    }

    /// Replace the engine's output callbacks, returning the previous ones.
    ///
    /// The previous callbacks stay alive until the engine has accepted the
    /// replacement.
    ///
    /// ## Errors
    ///
    /// - `EngineCallFailed`: the engine refused the callbacks; the previous
    ///   ones remain registered
    pub fn set_output_callbacks(&mut self, callbacks: Arc<dyn OutputCallbacks>) -> Result<Arc<dyn OutputCallbacks>>
    {
        self.engine
            .set_output_callbacks(Arc::clone(&callbacks))
            .op("set_output_callbacks")?;
        Ok(std::mem::replace(&mut self.output, callbacks))
    }

    /// Output callbacks currently registered with the engine.
    pub fn output_callbacks(&self) -> Arc<dyn OutputCallbacks>
    {
        Arc::clone(&self.output)
    }
}

/// Decode a name the engine wrote into `buf`, reporting `reported` bytes.
///
/// Keeps what fits in the buffer and strips the trailing NUL.
pub(crate) fn decode_name(operation: &'static str, buf: &[u8], reported: usize) -> String
{
    if reported > buf.len() {
        warn!(
            "{}: name truncated to {} of {} bytes",
            operation,
            buf.len(),
            reported
        );
    }
    let mut bytes = &buf[..reported.min(buf.len())];
    if let Some(nul) = bytes.iter().position(|b| *b == 0) {
        bytes = &bytes[..nul];
    }
    let name = String::from_utf8_lossy(bytes).into_owned();
    trace!("{}: decoded name {:?}", operation, name);
    name
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_decode_name_strips_nul()
    {
        assert_eq!(decode_name("test", b"_EPROCESS\0junk", 10), "_EPROCESS");
        assert_eq!(decode_name("test", b"abc", 3), "abc");
    }

    #[test]
    fn test_decode_name_keeps_truncated_prefix()
    {
        assert_eq!(decode_name("test", b"abcd", 9), "abcd");
        assert_eq!(decode_name("test", b"", 0), "");
    }
}
